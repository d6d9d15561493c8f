fn main() {
    std::process::exit(chunkwise_cli::main_entry());
}
