//! The bundled reqwest transport against a local HTTP/1.1 server that
//! advertises byte ranges but answers every GET with the whole body.

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::png;
use fastheader::io::{BULK_FETCH_THRESHOLD, ReqwestTransport};
use fastheader::{ErrorKind, ExtractOptions, Extractor, HeaderResult, Origin};

const LARGE_BODY: usize = 40 << 20;

#[derive(Clone, Copy)]
enum Framing {
    /// `Content-Length` on the GET reply.
    Declared,
    /// `Transfer-Encoding: chunked`, so the length is unknown up front.
    Chunked,
}

fn read_request_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Write the body until done or the client hangs up. Returns body bytes written.
fn send_body(stream: &mut TcpStream, body: &[u8], framing: Framing) -> u64 {
    let header = match framing {
        Framing::Declared => format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        ),
        Framing::Chunked => {
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_string()
        }
    };
    if stream.write_all(header.as_bytes()).is_err() {
        return 0;
    }

    let mut sent = 0u64;
    for chunk in body.chunks(64 * 1024) {
        let written = match framing {
            Framing::Declared => stream.write_all(chunk),
            Framing::Chunked => stream
                .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                .and_then(|_| stream.write_all(chunk))
                .and_then(|_| stream.write_all(b"\r\n")),
        };
        if written.is_err() {
            return sent;
        }
        sent += chunk.len() as u64;
    }
    if let Framing::Chunked = framing {
        let _ = stream.write_all(b"0\r\n\r\n");
    }
    sent
}

/// Serve one HEAD and one GET, then report how many body bytes went out.
fn serve(body: Vec<u8>, framing: Framing) -> (String, JoinHandle<u64>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/volume.bin", listener.local_addr().unwrap());

    let handle = thread::spawn(move || {
        let mut sent = 0;
        for _ in 0..2 {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            stream
                .set_write_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let head = read_request_head(&mut stream);
            if head.starts_with("HEAD") {
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nAccept-Ranges: bytes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
            } else {
                sent += send_body(&mut stream, &body, framing);
            }
        }
        sent
    });
    (url, handle)
}

fn extract(url: &str) -> HeaderResult {
    let options = ExtractOptions {
        timeout: Some(Duration::from_secs(20)),
        ..ExtractOptions::default()
    };
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let transport = ReqwestTransport::with_client(client).unwrap();
    // Dropping the extractor shuts its runtime down and closes the sockets.
    let extractor = Extractor::with_transport(transport, options);
    extractor.extract(&Origin::parse(url))
}

#[test]
fn test_declared_oversized_body_is_never_read() {
    let (url, server) = serve(vec![0u8; LARGE_BODY], Framing::Declared);

    let result = extract(&url);
    let sent = server.join().unwrap();

    assert_eq!(result.error, Some(ErrorKind::NoRangeLarge));
    assert_eq!(result.requests_made, 2);
    assert_eq!(result.bytes_fetched, 0);
    assert!(sent < LARGE_BODY as u64, "server sent {sent} bytes");
}

#[test]
fn test_undeclared_body_stops_at_threshold() {
    let (url, server) = serve(vec![0u8; LARGE_BODY], Framing::Chunked);

    let result = extract(&url);
    let sent = server.join().unwrap();

    assert_eq!(result.error, Some(ErrorKind::NoRangeLarge));
    assert_eq!(result.requests_made, 2);
    assert!(result.bytes_fetched >= BULK_FETCH_THRESHOLD);
    assert!(
        result.bytes_fetched < BULK_FETCH_THRESHOLD + (1 << 20),
        "fetched {} bytes",
        result.bytes_fetched
    );
    assert!(sent < LARGE_BODY as u64, "server sent {sent} bytes");
}

#[test]
fn test_small_body_becomes_resident() {
    let body = png(640, 480, 8, 5000);
    let len = body.len() as u64;
    let (url, server) = serve(body, Framing::Declared);

    let result = extract(&url);
    server.join().unwrap();

    assert!(result.success, "{result:?}");
    let data = result.data.unwrap();
    assert_eq!((data.width, data.height), (640, 480));
    assert_eq!(result.bytes_fetched, len);
    assert_eq!(result.requests_made, 2);
}
