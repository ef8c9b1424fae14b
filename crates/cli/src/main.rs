use std::process::ExitCode;

fn main() -> ExitCode {
    zenthor_cli::run()
}
