//! # axum-byteranges
//!
//! HTTP byte-range set resolution and range responses for [`axum`][1].
//!
//! The heart of the crate is [`RangeSet`]: an immutable value carrying the
//! ranges a client requested, with validation ([`RangeSet::is_valid`]) and
//! resolution against a known resource length ([`RangeSet::merge`]) into the
//! minimal ordered set of absolute byte intervals. Overlapping and touching
//! ranges collapse into one; a request for more than
//! [`DEFAULT_MAX_RANGE_COUNT`] ranges degenerates to a single covering span.
//!
//! On top of that sits [`Ranged`], a responder turning a range set and any
//! [`RangeBody`] into a `200`, `206` (single range or multipart/byteranges)
//! or `416` response. Any type implementing [`AsyncRead`] and
//! [`AsyncSeekStart`] can be served through the [`KnownSize`] adapter; there
//! is special cased support for [`tokio::fs::File`], see [`KnownSize::file`].
//!
//! ```
//! use axum::Router;
//! use axum::routing::get;
//!
//! use std::path::PathBuf;
//! use std::str::FromStr;
//!
//! use axum_byteranges::{KnownSize, Ranged, RangeSetHeader};
//!
//! async fn file(RangeSetHeader(ranges): RangeSetHeader) -> Ranged<KnownSize<tokio::fs::File>> {
//!     let path = PathBuf::from_str("document.txt").unwrap();
//!     let body = KnownSize::file(path).await.unwrap();
//!     Ranged::new(ranges, body, None)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let _app = Router::<()>::new().route("/", get(file));
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

mod file;
mod set;
mod stream;

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange};
use axum_extra::TypedHeader;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::debug;

pub use file::KnownSize;
pub use set::{
    EmptyRangeSet, ParseRangeSetError, RangeSet, RangeSpec, ResolvedRange,
    BYTES_UNIT, DEFAULT_MAX_RANGE_COUNT,
};
pub use stream::{extract_boundary, MultipartStream, RangedStream};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] with a fixed known byte size.
pub trait RangeBody: AsyncRead + AsyncSeekStart {
    /// The total size of the underlying resource in bytes.
    ///
    /// This should not change for the lifetime of the object once queried.
    /// Behaviour is not guaranteed if it does change.
    fn byte_size(&self) -> u64;
}

/// Extractor for the request `Range` header as a parsed [`RangeSet`].
///
/// A missing or unparseable header extracts as `None`. RFC 7233 sec 3.1
/// permits a server to ignore the header, so a garbled one never rejects
/// the request; [`Ranged`] then serves the full resource.
#[derive(Debug, Clone)]
pub struct RangeSetHeader(pub Option<RangeSet>);

impl<S: Send + Sync> FromRequestParts<S> for RangeSetHeader {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ranges = parts
            .headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        Ok(RangeSetHeader(ranges))
    }
}

/// The main responder type. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct Ranged<B: RangeBody + Send + 'static> {
    ranges: Option<RangeSet>,
    body: B,
    content_type: Option<String>,
}

impl<B: RangeBody + Send + 'static> Ranged<B> {
    /// Construct a ranged response over any type implementing [`RangeBody`],
    /// an optional requested [`RangeSet`] and an optional content type.
    pub fn new(ranges: Option<RangeSet>, body: B, content_type: Option<String>) -> Self {
        Ranged { ranges, body, content_type }
    }

    /// Responds to the request, returning headers and body as
    /// [`RangedResponse`]. Returns [`RangeNotSatisfiable`] if the requested
    /// set was valid but nothing in it resolved against the resource.
    pub fn try_respond(self) -> Result<RangedResponse<B>, RangeNotSatisfiable> {
        let Ranged { ranges, body, content_type } = self;
        let total_bytes = body.byte_size();

        // An absent Range header and an invalid one land in the same place:
        // serve the whole resource (RFC 7233 sec 3.1 permits ignoring the
        // header rather than erroring).
        let ranges = match ranges {
            Some(ranges) if ranges.is_valid() => ranges,
            Some(ranges) => {
                debug!(%ranges, "ignoring invalid range set");
                return Ok(RangedResponse::full(body, content_type));
            }
            None => return Ok(RangedResponse::full(body, content_type)),
        };

        let length = i64::try_from(total_bytes).unwrap_or(i64::MAX);
        let resolved = ranges.merge(length, DEFAULT_MAX_RANGE_COUNT);
        debug!(%ranges, total_bytes, count = resolved.len(), "resolved range request");

        match resolved.as_slice() {
            [] => {
                // nothing in range: 416 carrying the resource's actual size
                let content_range = ContentRange::unsatisfied_bytes(total_bytes);
                Err(RangeNotSatisfiable(content_range))
            }
            [range] => {
                let (start, end_exclusive) = (range.start as u64, range.end as u64 + 1);
                let content_range = ContentRange::bytes(start..end_exclusive, total_bytes)
                    .map_err(|_| RangeNotSatisfiable(ContentRange::unsatisfied_bytes(total_bytes)))?;
                let content_length = ContentLength(range.len());
                let stream = RangedStream::new(body, start, range.len());
                Ok(RangedResponse::Single { content_range, content_length, stream, content_type })
            }
            _ => {
                let boundary = stream::generate_boundary();
                let stream = MultipartStream::new(
                    body,
                    resolved,
                    total_bytes,
                    boundary.clone(),
                    content_type,
                );
                Ok(RangedResponse::Multiple { boundary, stream })
            }
        }
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for Ranged<B> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested range was not satisfiable. Implements [`IntoResponse`].
#[derive(Debug, Clone)]
pub struct RangeNotSatisfiable(pub ContentRange);

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.0);
        (status, header, ()).into_response()
    }
}

/// Data type containing computed headers and body for a range response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse<B> {
    /// Full content response: no range requested, or the request was ignored.
    Full {
        content_length: ContentLength,
        stream: RangedStream<B>,
        content_type: Option<String>,
    },
    /// Partial content response for a single resolved interval.
    Single {
        content_range: ContentRange,
        content_length: ContentLength,
        stream: RangedStream<B>,
        content_type: Option<String>,
    },
    /// `multipart/byteranges` response for several disjoint intervals.
    /// Part content types travel inside the stream.
    Multiple {
        boundary: String,
        stream: MultipartStream<B>,
    },
}

impl<B: RangeBody + Send + 'static> RangedResponse<B> {
    fn full(body: B, content_type: Option<String>) -> Self {
        let total_bytes = body.byte_size();
        RangedResponse::Full {
            content_length: ContentLength(total_bytes),
            stream: RangedStream::new(body, 0, total_bytes),
            content_type,
        }
    }
}

fn set_content_type(response: &mut Response, content_type: Option<String>) {
    let value = content_type
        .and_then(|content_type| HeaderValue::from_str(&content_type).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    response.headers_mut().insert(header::CONTENT_TYPE, value);
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedResponse<B> {
    fn into_response(self) -> Response {
        let accept_ranges = TypedHeader(AcceptRanges::bytes());

        match self {
            RangedResponse::Full { content_length, stream, content_type } => {
                let mut response =
                    (StatusCode::OK, accept_ranges, TypedHeader(content_length), stream)
                        .into_response();
                set_content_type(&mut response, content_type);
                response
            }
            RangedResponse::Single { content_range, content_length, stream, content_type } => {
                let mut response = (
                    StatusCode::PARTIAL_CONTENT,
                    accept_ranges,
                    TypedHeader(content_range),
                    TypedHeader(content_length),
                    stream,
                )
                    .into_response();
                set_content_type(&mut response, content_type);
                response
            }
            RangedResponse::Multiple { boundary, stream } => {
                let content_type = format!("multipart/byteranges; boundary={boundary}");
                let mut response =
                    (StatusCode::PARTIAL_CONTENT, accept_ranges, stream).into_response();
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_str(&content_type)
                        .expect("boundary is always a valid header value"),
                );
                response
            }
        }
    }
}
