//! Implementation of the so-called "stdio" transport, which is another way of saying a transport
//! in which the entire process is handling a single peer, with messages coming in on stdin,
//! messages going out on stdout, and log events (if any) usually logged to stderr.
use super::StreamTransport;

pub type StdioTransport = StreamTransport<
    tokio::io::BufReader<tokio::io::Stdin>,
    tokio::io::BufWriter<tokio::io::Stdout>,
>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Self::new(
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::BufWriter::new(tokio::io::stdout()),
        )
    }
}
