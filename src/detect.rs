// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2025 Yeuham Wang <rcold@rcold.name>

const SOCKS5_VERSION: u8 = 0x05;

const HTTP_METHODS: [&[u8]; 7] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"CONNECT ",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Socks5,
    Http,
}

/// Classifies the first chunk of a connection. Anything that is not clearly
/// SOCKS5 is handed to the HTTP handler, which rejects what it cannot parse.
pub fn detect(buf: &[u8]) -> Protocol {
    if buf.len() >= 3 && buf[0] == SOCKS5_VERSION {
        Protocol::Socks5
    } else {
        Protocol::Http
    }
}

/// Whether `buf` starts with a known HTTP method followed by a space.
pub fn has_http_method(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| buf.starts_with(method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_greeting() {
        assert_eq!(detect(&[0x05, 0x01, 0x00]), Protocol::Socks5);
    }

    #[test]
    fn http_request_line() {
        let buf = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(detect(buf), Protocol::Http);
        assert!(has_http_method(buf));
        assert!(has_http_method(b"CONNECT example.com:443 HTTP/1.1\r\n"));
    }

    #[test]
    fn unknown_bytes_fall_back_to_http() {
        assert_eq!(detect(&[0xAA]), Protocol::Http);
        assert!(!has_http_method(&[0xAA]));
    }

    #[test]
    fn short_socks5_prefix_falls_back_to_http() {
        assert_eq!(detect(&[0x05]), Protocol::Http);
        assert_eq!(detect(&[0x05, 0x01]), Protocol::Http);
    }

    #[test]
    fn method_requires_trailing_space() {
        assert!(!has_http_method(b"GETX / HTTP/1.1"));
        assert!(!has_http_method(b"get / HTTP/1.1"));
    }
}
