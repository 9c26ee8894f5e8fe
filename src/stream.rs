use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::ReadBuf;

use crate::{RangeBody, ResolvedRange};

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Response body stream for a single byte interval.
/// Implements [`Stream`], [`Body`], and [`IntoResponse`].
#[pin_project]
pub struct RangedStream<B> {
    state: StreamState,
    length: u64,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub(crate) fn new(body: B, start: u64, length: u64) -> Self {
        RangedStream {
            state: StreamState::Seek { start },
            length,
            body,
        }
    }
}

impl<B> std::fmt::Debug for RangedStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedStream")
            .field("state", &self.state)
            .field("length", &self.length)
            .finish()
    }
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if let StreamState::Seek { start } = *this.state {
            match this.body.as_mut().start_seek(start) {
                Err(e) => { return Poll::Ready(Some(Err(e))); }
                Ok(()) => {
                    let remaining = *this.length;
                    *this.state = StreamState::Seeking { remaining };
                }
            }
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.body.as_mut().poll_complete(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => { return Poll::Ready(Some(Err(e))); }
                Poll::Ready(Ok(())) => {
                    let buffer = allocate_buffer();
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        if let StreamState::Reading { buffer, remaining } = this.state {
            let uninit = buffer.spare_capacity_mut();

            // read no more than the buffer size and no more than the bytes
            // left in the interval
            let nbytes = std::cmp::min(
                uninit.len(),
                usize::try_from(*remaining).unwrap_or(usize::MAX),
            );

            let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

            match this.body.as_mut().poll_read(cx, &mut read_buf) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => { return Poll::Ready(Some(Err(e))); }
                Poll::Ready(Ok(())) => {
                    match read_buf.filled().len() {
                        0 => { return Poll::Ready(None); }
                        n => {
                            // SAFETY: poll_read has filled the buffer with `n`
                            // additional bytes. `buffer.len` should always be
                            // 0 here, but include it for rigorous correctness
                            unsafe { buffer.set_len(buffer.len() + n); }

                            // replace state buffer and take this one to return
                            let chunk = mem::replace(buffer, allocate_buffer());

                            // this usize->u64 conversion always succeeds:
                            // n cannot exceed remaining due to the cmp::min
                            // above
                            *remaining -= u64::try_from(n).unwrap();

                            return Poll::Ready(Some(Ok(chunk.freeze())));
                        }
                    }
                }
            }
        }

        unreachable!();
    }
}

/// `multipart/byteranges` response body stream over several disjoint
/// resolved intervals. Implements [`Stream`], [`Body`], and [`IntoResponse`].
#[pin_project]
pub struct MultipartStream<B> {
    state: MultipartState,
    ranges: Vec<ResolvedRange>,
    current: usize,
    total_bytes: u64,
    boundary: String,
    content_type: Option<String>,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> MultipartStream<B> {
    pub(crate) fn new(
        body: B,
        ranges: Vec<ResolvedRange>,
        total_bytes: u64,
        boundary: String,
        content_type: Option<String>,
    ) -> Self {
        MultipartStream {
            state: MultipartState::PartHead { first: true },
            ranges,
            current: 0,
            total_bytes,
            boundary,
            content_type,
            body,
        }
    }
}

impl<B> std::fmt::Debug for MultipartStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartStream")
            .field("state", &self.state)
            .field("ranges", &self.ranges)
            .field("current", &self.current)
            .field("total_bytes", &self.total_bytes)
            .field("boundary", &self.boundary)
            .field("content_type", &self.content_type)
            .finish()
    }
}

#[derive(Debug)]
enum MultipartState {
    PartHead { first: bool },
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Epilogue,
    Done,
}

impl<B: RangeBody + Send + 'static> IntoResponse for MultipartStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for MultipartStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        // boundary and part header overhead makes the exact size awkward to
        // predict up front
        SizeHint::default()
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for MultipartStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            match this.state {
                MultipartState::PartHead { first } => {
                    if *this.current >= this.ranges.len() {
                        *this.state = MultipartState::Epilogue;
                        continue;
                    }

                    let range = this.ranges[*this.current];
                    let leading = if mem::replace(first, false) { "" } else { "\r\n" };
                    let content_type =
                        this.content_type.as_deref().unwrap_or("application/octet-stream");
                    let head = format!(
                        "{leading}--{boundary}\r\n\
                         Content-Type: {content_type}\r\n\
                         Content-Range: bytes {range}/{total}\r\n\r\n",
                        boundary = this.boundary,
                        total = this.total_bytes,
                    );

                    *this.state = MultipartState::Seek { start: range.start as u64 };
                    return Poll::Ready(Some(Ok(Bytes::from(head))));
                }

                MultipartState::Seek { start } => {
                    match this.body.as_mut().start_seek(*start) {
                        Err(e) => return Poll::Ready(Some(Err(e))),
                        Ok(()) => {
                            let remaining = this.ranges[*this.current].len();
                            *this.state = MultipartState::Seeking { remaining };
                        }
                    }
                }

                MultipartState::Seeking { remaining } => {
                    match this.body.as_mut().poll_complete(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(Ok(())) => {
                            let buffer = allocate_buffer();
                            *this.state =
                                MultipartState::Reading { buffer, remaining: *remaining };
                        }
                    }
                }

                MultipartState::Reading { buffer, remaining } => {
                    if *remaining == 0 {
                        *this.current += 1;
                        *this.state = MultipartState::PartHead { first: false };
                        continue;
                    }

                    let uninit = buffer.spare_capacity_mut();
                    let nbytes = std::cmp::min(
                        uninit.len(),
                        usize::try_from(*remaining).unwrap_or(usize::MAX),
                    );
                    let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

                    match this.body.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(Ok(())) => match read_buf.filled().len() {
                            0 => {
                                // the part head already declared a full
                                // Content-Range; a short body must fail the
                                // stream, not hand the client truncated data
                                let err = io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    format!(
                                        "body ended {remaining} bytes short of range {}",
                                        this.ranges[*this.current],
                                    ),
                                );
                                return Poll::Ready(Some(Err(err)));
                            }
                            n => {
                                // SAFETY: poll_read has filled the buffer
                                // with `n` additional bytes
                                unsafe { buffer.set_len(buffer.len() + n); }

                                let chunk = mem::replace(buffer, allocate_buffer());
                                *remaining -= u64::try_from(n).unwrap();
                                return Poll::Ready(Some(Ok(chunk.freeze())));
                            }
                        },
                    }
                }

                MultipartState::Epilogue => {
                    let closing = format!("\r\n--{}--\r\n", this.boundary);
                    *this.state = MultipartState::Done;
                    return Poll::Ready(Some(Ok(Bytes::from(closing))));
                }

                MultipartState::Done => {
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Generate a unique boundary string for a multipart response.
pub(crate) fn generate_boundary() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("byterange-{timestamp:x}")
}

/// Pull the boundary parameter out of a `multipart/byteranges` content type,
/// e.g. for reassembling parts on the client side.
pub fn extract_boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"'))
}

fn allocate_buffer() -> BytesMut {
    BytesMut::with_capacity(IO_BUFFER_SIZE)
}
