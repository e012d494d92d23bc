//! Remote-cluster context support.
//!
//! Local terminals can be created pre-pointed at a kubectl context: the
//! child's environment carries a marker variable and, shortly after spawn,
//! two input lines select the context and confirm it. The catalog surface
//! also lists available contexts.

/// Available kubectl contexts, empty when the tool is absent or errors.
pub async fn list_contexts() -> Vec<String> {
    let output = match tokio::process::Command::new("kubectl")
        .args(["config", "get-contexts", "-o", "name"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Environment marker set on shells created with a context.
pub const CONTEXT_ENV_VAR: &str = "KUBE_CONTEXT";

/// The two lines written into a fresh shell to select a context: the
/// selection itself, then a visible confirmation.
pub fn context_select_lines(context: &str) -> [String; 2] {
    [
        format!("kubectl config use-context {context}\n"),
        format!("echo \"kubectl context: {context}\"\n"),
    ]
}
