use std::process::ExitCode;

use selmon::clipboard::BackendKind;

fn main() -> ExitCode {
    selmon::cli::run(BackendKind::XWayland)
}
