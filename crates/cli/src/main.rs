use std::process::ExitCode;

fn main() -> ExitCode {
    fbuild::main(fbuild::demo::registry())
}
