//! HTTP request manager against a loopback HTTP/1.1 server.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft::http::{HttpOptions, HttpResponse, Method};
use weft::{Error, EventLoop, Result};

/// Minimal HTTP/1.1 server: one thread per connection, responses decided
/// by path, always `Connection: close`.
fn spawn_server(delay: Duration) -> (String, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let join = std::thread::spawn(move || {
        // Served until the listener errors out (test end drops nothing, so
        // bound the accept count instead).
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            std::thread::spawn(move || serve_one(stream, delay));
        }
    });
    (format!("http://{}", addr), join)
}

fn serve_one(mut stream: TcpStream, delay: Duration) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return,
        }
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

    // Finish reading a body if the request announced one.
    if let Some(len) = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        while buf.len() < head_end + len {
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => return,
            }
        }
    }

    if !delay.is_zero() {
        std::thread::sleep(delay);
    }

    let response: Vec<u8> = match path.as_str() {
        "/hello" => b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Tag: a\r\nX-Tag: b\r\nConnection: close\r\n\r\nhello".to_vec(),
        "/chunked" => {
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n".to_vec()
        }
        "/redirect" => {
            b"HTTP/1.1 302 Found\r\nLocation: /hello\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
        }
        "/missing" => {
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nnot found".to_vec()
        }
        "/echo-body" => {
            let body = &buf[head_end..];
            let mut out = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            out.extend_from_slice(body);
            out
        }
        "/eof-body" => b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nstream-until-close".to_vec(),
        _ => b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_vec(),
    };
    let _ = stream.write_all(&response);
    let _ = stream.flush();
}

fn fetch(lp: &EventLoop, url: &str, options: HttpOptions) -> Result<HttpResponse> {
    let slot: Rc<RefCell<Option<Result<HttpResponse>>>> = Rc::new(RefCell::new(None));
    let out = Rc::clone(&slot);
    lp.handle()
        .http_request(url, options, move |result| {
            *out.borrow_mut() = Some(result);
        })
        .unwrap();
    lp.run().unwrap();
    slot.borrow_mut().take().expect("request completed")
}

#[test]
fn get_with_content_length_and_multi_headers() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();

    let response = fetch(&lp, &format!("{}/hello", base), HttpOptions::default()).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.version.as_deref(), Some("1.1"));
    assert_eq!(response.body, b"hello");
    assert_eq!(response.headers.get_all("x-tag"), vec!["a", "b"]);
}

#[test]
fn chunked_body_is_decoded() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();
    let response = fetch(&lp, &format!("{}/chunked", base), HttpOptions::default()).unwrap();
    assert_eq!(response.body, b"Wikipedia");
}

#[test]
fn close_delimited_body_reads_to_eof() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();
    let response = fetch(&lp, &format!("{}/eof-body", base), HttpOptions::default()).unwrap();
    assert_eq!(response.body, b"stream-until-close");
}

#[test]
fn post_body_roundtrips() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();
    let options = HttpOptions {
        method: Method::Post,
        body: b"payload=42".to_vec(),
        ..HttpOptions::default()
    };
    let response = fetch(&lp, &format!("{}/echo-body", base), options).unwrap();
    assert_eq!(response.body, b"payload=42");
}

#[test]
fn error_statuses_are_responses_not_errors() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();
    let response = fetch(&lp, &format!("{}/missing", base), HttpOptions::default()).unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.body, b"not found");
}

#[test]
fn redirects_are_followed() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();
    let response = fetch(&lp, &format!("{}/redirect", base), HttpOptions::default()).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");
}

#[test]
fn redirects_can_be_disabled() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();
    let options = HttpOptions {
        follow_redirects: false,
        ..HttpOptions::default()
    };
    let response = fetch(&lp, &format!("{}/redirect", base), options).unwrap();
    assert_eq!(response.status, 302);
    assert_eq!(response.headers.get("location"), Some("/hello"));
}

#[test]
fn five_slow_requests_run_concurrently() {
    let (base, _join) = spawn_server(Duration::from_millis(150));
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let results: Rc<RefCell<Vec<Option<u16>>>> = Rc::new(RefCell::new(vec![None; 5]));
    let started = Instant::now();
    for i in 0..5 {
        let out = Rc::clone(&results);
        handle
            .http_request(&format!("{}/hello", base), HttpOptions::default(), move |r| {
                out.borrow_mut()[i] = Some(r.map(|resp| resp.status).unwrap_or(0));
            })
            .unwrap();
    }
    lp.run().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(*results.borrow(), vec![Some(200); 5]);
    // Five 150 ms responses in parallel, not in sequence.
    assert!(elapsed < Duration::from_millis(600), "elapsed {:?}", elapsed);
}

#[test]
fn streaming_hooks_fire_for_headers_body_and_progress() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();

    let header_names: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let streamed: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let progress: Rc<RefCell<Vec<(u64, Option<u64>)>>> = Rc::new(RefCell::new(Vec::new()));

    let names = Rc::clone(&header_names);
    let sink = Rc::clone(&streamed);
    let ticks = Rc::clone(&progress);
    let options = HttpOptions {
        header_callback: Some(Box::new(move |name, _value| {
            names.borrow_mut().push(name.to_ascii_lowercase());
        })),
        write_callback: Some(Box::new(move |fragment| {
            sink.borrow_mut().extend_from_slice(fragment);
        })),
        progress_callback: Some(Box::new(move |received, total| {
            ticks.borrow_mut().push((received, total));
        })),
        ..HttpOptions::default()
    };

    let response = fetch(&lp, &format!("{}/hello", base), options).unwrap();

    assert_eq!(response.status, 200);
    assert!(response.body.is_empty(), "streamed bodies are not buffered");
    assert_eq!(streamed.borrow().as_slice(), b"hello");
    assert!(
        header_names.borrow().iter().any(|n| n == "content-length"),
        "headers seen: {:?}",
        header_names.borrow()
    );
    let ticks = progress.borrow();
    assert_eq!(ticks.last(), Some(&(5, Some(5))));
    assert!(ticks.windows(2).all(|w| w[0].0 <= w[1].0), "monotonic progress");
}

#[test]
fn chunked_bodies_stream_decoded() {
    let (base, _join) = spawn_server(Duration::ZERO);
    let lp = EventLoop::new().unwrap();

    let streamed: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&streamed);
    let options = HttpOptions {
        write_callback: Some(Box::new(move |fragment| {
            sink.borrow_mut().extend_from_slice(fragment);
        })),
        ..HttpOptions::default()
    };

    let response = fetch(&lp, &format!("{}/chunked", base), options).unwrap();
    assert!(response.body.is_empty());
    assert_eq!(streamed.borrow().as_slice(), b"Wikipedia");
}

#[test]
fn cancel_removes_the_request_without_a_callback() {
    let (base, _join) = spawn_server(Duration::from_millis(200));
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let fired = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&fired);
    let id = handle
        .http_request(&format!("{}/hello", base), HttpOptions::default(), move |_| {
            *flag.borrow_mut() = true;
        })
        .unwrap();

    let canceller = handle.clone();
    handle.set_timeout(Duration::from_millis(20), move || {
        assert!(canceller.http_cancel(id));
        assert!(!canceller.http_cancel(id));
    });

    let started = Instant::now();
    lp.run().unwrap();
    assert!(!*fired.borrow());
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[test]
fn request_timeout_is_a_distinct_error() {
    let (base, _join) = spawn_server(Duration::from_millis(500));
    let lp = EventLoop::new().unwrap();
    let options = HttpOptions {
        timeout: Some(Duration::from_millis(40)),
        ..HttpOptions::default()
    };
    let started = Instant::now();
    let result = fetch(&lp, &format!("{}/hello", base), options);
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[test]
fn https_is_rejected_up_front() {
    let lp = EventLoop::new().unwrap();
    let result = lp
        .handle()
        .http_request("https://example.com/", HttpOptions::default(), |_| {});
    assert!(matches!(result, Err(Error::Unsupported(_))));
    drop(lp);
}

#[test]
fn invalid_url_is_rejected_up_front() {
    let lp = EventLoop::new().unwrap();
    let result = lp
        .handle()
        .http_request("not a url", HttpOptions::default(), |_| {});
    assert!(matches!(result, Err(Error::Http(_))));
}
