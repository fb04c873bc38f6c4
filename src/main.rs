fn main() {
    let code = lathe::run::run().unwrap_or_else(|err| {
        eprintln!("lathe: {}", err);
        2
    });
    std::process::exit(code);
}
