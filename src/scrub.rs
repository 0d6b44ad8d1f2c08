//! Credential scrubbing for anything that reaches disk or a terminal.

/// Replace every occurrence of a secret value with a marker. Applied to
/// stage logs and error messages before they are written.
pub fn scrub(text: &str, secrets: &[String]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.len() >= 4 {
            out = out.replace(secret.as_str(), "***");
        }
    }
    out
}
