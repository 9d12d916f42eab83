use std::process::ExitCode;

pub type CliResult<T> = anyhow::Result<T>;

/// Exit status for a program that could not be found or launched, as shells
/// report it
const LAUNCH_FAILURE: u8 = 127;

/// Convert a CliResult to an ExitCode, printing errors to stderr
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            if is_launch_failure(&e) {
                ExitCode::from(LAUNCH_FAILURE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_launch_failure(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.is::<which::Error>()
            || matches!(
                cause.downcast_ref::<tether::Error>(),
                Some(tether::Error::Spawn { .. })
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_launch_failure_detected_through_context() {
        let spawn = tether::Error::Spawn {
            program: "z3".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let error = Err::<(), _>(spawn).context("starting solver").unwrap_err();
        assert!(is_launch_failure(&error));
    }

    #[test]
    fn test_other_errors_are_not_launch_failures() {
        assert!(!is_launch_failure(&anyhow::anyhow!("no reply")));
        assert!(!is_launch_failure(&anyhow::Error::new(
            tether::Error::EmptyCommand
        )));
    }
}
