mod helpers;

use b_x::{BxForResults, BX};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use weir::{
    h2::{client, server},
    Acceptor, IncomingRequest, Request, Response, SendRequest, SessionConf, StreamError,
};

use crate::helpers::read_body;

/// Runs both ends of an HTTP/2 connection over an in-memory pipe. `serve`
/// answers requests one at a time, `client` drives the test and must drop
/// its handles when done so the connection winds down.
async fn with_connection<S, SF, C, CF>(
    conf: SessionConf,
    serve: S,
    client: C,
) -> Result<(), BX>
where
    S: FnOnce(Acceptor) -> SF,
    SF: std::future::Future<Output = Result<(), BX>>,
    C: FnOnce(SendRequest) -> CF,
    CF: std::future::Future<Output = Result<(), BX>>,
{
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_conn, send_request) = client::handshake(client_io, conf.clone());
    let (server_conn, acceptor) = server::handshake(server_io, conf);

    let (client_res, server_res, serve_res, test_res) = tokio::join!(
        client_conn.run(),
        server_conn.run(),
        serve(acceptor),
        client(send_request),
    );
    test_res?;
    serve_res?;
    client_res?;
    server_res?;
    Ok(())
}

async fn echo(mut acceptor: Acceptor) -> Result<(), BX> {
    while let Some(IncomingRequest {
        request,
        mut body,
        respond,
    }) = acceptor.accept().await
    {
        let payload = read_body(&mut body).await?;
        let trailers = body.trailers().await?;
        let path = request.path.as_ref().map(|p| p.as_str()).unwrap_or("/");

        let response = Response::new(StatusCode::OK).with_header(
            HeaderName::from_static("x-path"),
            HeaderValue::from_str(path).bx()?,
        );
        let mut send = respond.send_response(response, false).await?;
        send.send_data(Bytes::from(payload), trailers.is_none())
            .await?;
        if let Some(trailers) = trailers {
            send.send_trailers(trailers).await?;
        }
    }
    Ok(())
}

fn request(method: Method, path: &str) -> Request {
    Request::new(method, format!("https://example.org{path}").parse().unwrap())
}

#[test]
fn test_get_round_trip() {
    helpers::run(async {
        with_connection(Default::default(), echo, |mut client| async move {
            let (response, _send) = client.send_request(request(Method::GET, "/hi"), true).await?;
            let (response, mut body) = response.await?;
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.headers["x-path"], "/hi");
            assert_eq!(read_body(&mut body).await?, b"");
            Ok::<_, BX>(())
        })
        .await
    });
}

#[test]
fn test_post_body_and_trailers_are_echoed() {
    helpers::run(async {
        with_connection(Default::default(), echo, |mut client| async move {
            let (response, mut send) = client
                .send_request(request(Method::POST, "/upload"), false)
                .await?;
            send.send_data(Bytes::from_static(b"hello "), false).await?;
            send.send_data(Bytes::from_static(b"world"), false).await?;
            let mut trailers = HeaderMap::new();
            trailers.insert("x-checksum", HeaderValue::from_static("42"));
            send.send_trailers(trailers.clone()).await?;

            let (response, mut body) = response.await?;
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(read_body(&mut body).await?, b"hello world");
            assert_eq!(body.trailers().await?, Some(trailers));
            Ok::<_, BX>(())
        })
        .await
    });
}

#[test]
fn test_large_body_goes_through_flow_control() {
    const LEN: usize = 1024 * 1024;

    helpers::run(async {
        let serve = |mut acceptor: Acceptor| async move {
            while let Some(req) = acceptor.accept().await {
                let mut send = req
                    .respond
                    .send_response(Response::new(StatusCode::OK), false)
                    .await?;
                let chunk = Bytes::from(vec![b'a'; 64 * 1024]);
                for i in 0..LEN / chunk.len() {
                    let last = (i + 1) * chunk.len() == LEN;
                    send.send_data(chunk.clone(), last).await?;
                }
            }
            Ok::<_, BX>(())
        };

        // default windows: 64 KiB per stream and per connection
        with_connection(Default::default(), serve, |mut client| async move {
            let (response, _send) = client.send_request(request(Method::GET, "/big"), true).await?;
            let (_, mut body) = response.await?;
            let body = read_body(&mut body).await?;
            assert_eq!(body.len(), LEN);
            assert!(body.iter().all(|&b| b == b'a'));
            Ok::<_, BX>(())
        })
        .await
    });
}

#[test]
fn test_concurrent_requests() {
    helpers::run(async {
        with_connection(Default::default(), echo, |client| async move {
            let requests = (0..8).map(|i| {
                let mut client = client.clone();
                async move {
                    let path = format!("/{i}");
                    let (response, mut send) =
                        client.send_request(request(Method::POST, &path), false).await?;
                    send.send_data(Bytes::from(path.clone()), true).await?;
                    let (response, mut body) = response.await?;
                    assert_eq!(response.headers["x-path"], path.as_str());
                    assert_eq!(read_body(&mut body).await?, path.as_bytes());
                    Ok::<_, BX>(())
                }
            });
            for res in futures_util::future::join_all(requests).await {
                res?;
            }
            Ok::<_, BX>(())
        })
        .await
    });
}

#[test]
fn test_server_reset_reaches_client() {
    helpers::run(async {
        let serve = |mut acceptor: Acceptor| async move {
            while let Some(req) = acceptor.accept().await {
                req.respond.reset(StreamError::Cancel);
            }
            Ok::<_, BX>(())
        };

        with_connection(Default::default(), serve, |mut client| async move {
            let (response, _send) = client.send_request(request(Method::GET, "/"), true).await?;
            match response.await {
                Err(StreamError::Reset(code)) => {
                    let cancel: weir_h2::ErrorCode = weir_h2::KnownErrorCode::Cancel.into();
                    assert_eq!(code, cancel);
                }
                other => panic!("expected a reset, got {:?}", other.map(|(res, _)| res)),
            }
            Ok::<_, BX>(())
        })
        .await
    });
}

#[test]
fn test_informational_responses_are_skipped() {
    helpers::run(async {
        let serve = |mut acceptor: Acceptor| async move {
            while let Some(mut req) = acceptor.accept().await {
                req.respond
                    .send_informational(Response::new(StatusCode::CONTINUE))
                    .await?;
                let body = read_body(&mut req.body).await?;
                let mut send = req
                    .respond
                    .send_response(Response::new(StatusCode::CREATED), false)
                    .await?;
                send.send_data(Bytes::from(body), true).await?;
            }
            Ok::<_, BX>(())
        };

        with_connection(Default::default(), serve, |mut client| async move {
            let (response, mut send) = client.send_request(request(Method::PUT, "/"), false).await?;
            send.send_data(Bytes::from_static(b"payload"), true).await?;
            let (response, mut body) = response.await?;
            assert_eq!(response.status, StatusCode::CREATED);
            assert_eq!(read_body(&mut body).await?, b"payload");
            Ok::<_, BX>(())
        })
        .await
    });
}
