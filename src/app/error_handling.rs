//! Fatal error handling for the CLI entry point.

use crate::error::OrchestraError;
use tracing::error;

/// Process a fatal error and exit with an appropriate status code.
///
/// `OrchestraError` gets its user-facing message plus, at `-v` and above,
/// the full context chain and recovery hint. Anything else falls back to
/// `anyhow`'s default chain rendering.
pub fn handle_fatal_error(err: anyhow::Error, verbose: u8) -> ! {
    error!("fatal error: {err}");

    let exit_code = if let Some(orch_err) = err.downcast_ref::<OrchestraError>() {
        eprintln!("Error: {orch_err}");
        if let Some(hint) = &orch_err.recovery_hint {
            eprintln!("  hint: {hint}");
        }
        if verbose >= 1 {
            eprintln!("\nContext:\n{}", orch_err.developer_message());
        }
        exit_code_for(orch_err)
    } else {
        eprintln!("Error: {err}");
        if verbose >= 1 {
            eprintln!("\nError chain:");
            for (i, cause) in err.chain().enumerate() {
                eprintln!("  {i}: {cause}");
            }
        }
        1
    };

    std::process::exit(exit_code)
}

fn exit_code_for(err: &OrchestraError) -> i32 {
    use crate::error::ErrorKind;
    match err.kind {
        ErrorKind::Config => 2,
        ErrorKind::AuthMissing | ErrorKind::AuthInvalid | ErrorKind::AuthExpired => 3,
        ErrorKind::Cancelled => 130,
        _ => 1,
    }
}
