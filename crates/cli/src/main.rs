use std::process::ExitCode;

fn main() -> ExitCode {
    expensio_cli::run()
}
