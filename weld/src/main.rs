fn main() {
    if let Err(error) = run() {
        libweld::error::report_error_and_exit(&error);
    }
}

fn run() -> libweld::error::Result {
    let linker = libweld::Linker::from_args(std::env::args().skip(1))?;
    linker.run()
}
