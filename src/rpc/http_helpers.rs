//! Shared plumbing for the HTTP clients of the three planes
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, Response};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::de::DeserializeOwned;
use serde::Serialize;

use silo_util::error::Error;

use crate::messages::ErrorResponse;

pub(crate) const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

// Everything that must not appear raw in a URI path, keeping '/' intact so
// namespace paths stay readable in logs
const PATH_SET: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'<')
	.add(b'>')
	.add(b'?')
	.add(b'`')
	.add(b'{')
	.add(b'}')
	.add(b'%');

/// Percent-encode a namespace path for use inside a URI
pub(crate) fn encode_path(path: &str) -> String {
	utf8_percent_encode(path, PATH_SET).to_string()
}

pub(crate) fn json_request<B: Serialize>(
	method: Method,
	uri: String,
	body: &B,
) -> Result<Request<Body>, Error> {
	let json = serde_json::to_vec(body)?;
	Ok(Request::builder()
		.method(method)
		.uri(uri)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Body::from(json))?)
}

pub(crate) fn empty_request(method: Method, uri: String) -> Result<Request<Body>, Error> {
	Ok(Request::builder().method(method).uri(uri).body(Body::empty())?)
}

pub(crate) fn msgpack_request<B: Serialize>(
	method: Method,
	uri: String,
	body: &B,
) -> Result<Request<Body>, Error> {
	let buf = rmp_serde::to_vec_named(body)?;
	Ok(Request::builder()
		.method(method)
		.uri(uri)
		.header(http::header::CONTENT_TYPE, "application/x-msgpack")
		.body(Body::from(buf))?)
}

/// Send a request and map non-2xx responses to `Error::Remote`
pub(crate) async fn send(
	client: &Client<HttpConnector>,
	req: Request<Body>,
	timeout: Duration,
) -> Result<Response<Body>, Error> {
	let resp = tokio::time::timeout(timeout, client.request(req)).await??;
	if resp.status().is_success() {
		return Ok(resp);
	}
	let status = resp.status();
	let body = hyper::body::to_bytes(resp.into_body()).await?;
	let message = serde_json::from_slice::<ErrorResponse>(&body)
		.map(|e| e.error)
		.unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
	debug!("Remote returned {}: {}", status, message);
	Err(Error::Remote(status, message))
}

pub(crate) async fn send_json<T: DeserializeOwned>(
	client: &Client<HttpConnector>,
	req: Request<Body>,
	timeout: Duration,
) -> Result<T, Error> {
	let resp = send(client, req, timeout).await?;
	let body = hyper::body::to_bytes(resp.into_body()).await?;
	Ok(serde_json::from_slice(&body)?)
}

pub(crate) async fn send_msgpack<T: DeserializeOwned>(
	client: &Client<HttpConnector>,
	req: Request<Body>,
	timeout: Duration,
) -> Result<T, Error> {
	let resp = send(client, req, timeout).await?;
	let body = hyper::body::to_bytes(resp.into_body()).await?;
	Ok(rmp_serde::decode::from_read_ref(&body)?)
}

pub(crate) async fn send_unit(
	client: &Client<HttpConnector>,
	req: Request<Body>,
	timeout: Duration,
) -> Result<(), Error> {
	send(client, req, timeout).await?;
	Ok(())
}
