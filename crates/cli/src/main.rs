use std::process::ExitCode;

fn main() -> ExitCode {
    syncso_cli::run()
}
