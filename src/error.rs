use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::dns_header::ResponseCode;

/// Errors raised while decoding, resolving or forwarding a DNS message
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("label `{0}` is longer than 63 bytes")]
    LabelTooLong(String),
    #[error("domain name `{0}` is longer than 255 bytes")]
    NameTooLong(String),
    #[error("domain name `{0}` contains an empty label")]
    EmptyLabel(String),
    #[error("upstream {upstream} did not reply within {timeout:?}")]
    UpstreamTimeout {
        upstream: SocketAddr,
        timeout: Duration,
    },
    #[error("upstream {upstream} is unreachable")]
    UpstreamUnreachable {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("no record for `{0}`")]
    NameError(String),
    #[error("every upstream transaction id is in flight")]
    InFlightExhausted,
}

impl DnsError {
    /// Response code a client should see for this failure
    pub fn rcode(&self) -> ResponseCode {
        match self {
            DnsError::NameError(_) => ResponseCode::NxDomain,
            DnsError::MalformedPacket(_)
            | DnsError::LabelTooLong(_)
            | DnsError::NameTooLong(_)
            | DnsError::EmptyLabel(_)
            | DnsError::UpstreamTimeout { .. }
            | DnsError::UpstreamUnreachable { .. }
            | DnsError::InFlightExhausted => ResponseCode::ServFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_error_maps_to_nxdomain() {
        let err = DnsError::NameError("nope.example".to_string());
        assert_eq!(err.rcode(), ResponseCode::NxDomain);
    }

    #[test]
    fn test_upstream_failures_map_to_servfail() {
        let upstream: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let timeout = DnsError::UpstreamTimeout {
            upstream,
            timeout: Duration::from_secs(1),
        };
        let unreachable = DnsError::UpstreamUnreachable {
            upstream,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };

        assert_eq!(timeout.rcode(), ResponseCode::ServFail);
        assert_eq!(unreachable.rcode(), ResponseCode::ServFail);
        assert_eq!(
            DnsError::MalformedPacket("short").rcode(),
            ResponseCode::ServFail
        );
    }
}
