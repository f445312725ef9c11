//! The subprocess primitive task bodies use to invoke external tools (the
//! compiler, in the GCC collaborator; any templating tool in others).
//!
//! Stdio is inherited rather than captured: task output interleaves with
//! the engine's own logging on the controlling terminal, matching how
//! `make` runs recipes.

use color_eyre::{Result, eyre::Context as _, eyre::bail};
use tracing::instrument;

/// Spawn `argv[0]` with `argv[1..]` as arguments, inheriting stdio, and
/// await its exit. Fails if the process exits non-zero or can't be
/// spawned at all.
///
/// The command line is echoed to stdout before spawning, exactly as
/// written, so a build log reads like a shell transcript.
#[instrument(skip(argv), fields(argv = %argv.join(" ")))]
pub async fn run(argv: &[String]) -> Result<()> {
    bail_if_empty(argv)?;
    println!("{}", argv.join(" "));

    let status = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .await
        .with_context(|| format!("spawn: {}", argv[0]))?;

    if !status.success() {
        bail!("command failed ({status}): {}", argv.join(" "));
    }
    Ok(())
}

fn bail_if_empty(argv: &[String]) -> Result<()> {
    if argv.is_empty() {
        bail!("empty argv");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_on_zero_exit() {
        run(&["true".to_owned()]).await.unwrap();
    }

    #[tokio::test]
    async fn fails_on_nonzero_exit() {
        let err = run(&["false".to_owned()]).await.unwrap_err();
        assert!(err.to_string().contains("command failed"));
    }

    #[tokio::test]
    async fn fails_on_missing_binary() {
        let err = run(&["definitely-not-a-real-binary-xyz".to_owned()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spawn"));
    }

    #[tokio::test]
    async fn fails_on_empty_argv() {
        let err = run(&[]).await.unwrap_err();
        assert!(err.to_string().contains("empty argv"));
    }
}
