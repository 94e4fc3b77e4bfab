use std::process::ExitCode;

fn main() -> ExitCode {
    sono_station::runtime::run_from_args()
}
