pub mod body;
pub mod client;
pub mod connector;
pub mod probe;
pub mod result;
pub mod tls;
pub mod trace;
pub mod transport;
pub mod validate;

pub mod prelude {
    pub use super::probe::HttpProber;
    pub use super::result::ProbeResult;
    pub use super::trace::PhaseDurations;
}

use std::fmt::Write;

/// Flattens an error and its sources into one message.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, ": {}", src);
        err = src;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("client error (Connect)")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_report_walks_the_source_chain() {
        let err = Outer(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(report(&err), "client error (Connect): connection refused");
    }
}
