//! Standalone sandbox worker: reads one request on stdin, answers on stdout.

fn main() {
    std::process::exit(chunkwise_sandbox::worker::serve_stdio());
}
