fn main() {
    if let Err(e) = roomcall_lib::run() {
        eprintln!("roomcall: {e}");
        std::process::exit(1);
    }
}
