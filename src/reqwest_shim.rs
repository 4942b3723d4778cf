//! Size-limited response body collection
//!
//! Reqwest does not limit response body sizes. Since this crate fetches data
//! from untrusted servers, unbounded bodies are a denial-of-service hazard;
//! these adapters reimplement `bytes`/`text`/`json` with a hard cap.

use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use futures_core::{ready, stream::BoxStream, Stream};
use pin_project_lite::pin_project;
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::{
    future::Future,
    marker::PhantomData,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

pin_project! {
    /// Collects a response body into [Bytes], failing once `limit` is passed.
    pub struct BytesFuture {
        #[pin]
        stream: BoxStream<'static, reqwest::Result<Bytes>>,
        limit: usize,
        aggregator: BytesMut,
    }
}

impl Future for BytesFuture {
    type Output = Result<Bytes, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            if let Some(chunk) = ready!(this.stream.poll_next(cx))
                .transpose()
                .map_err(Error::other)?
            {
                this.aggregator.put(chunk);
                if this.aggregator.len() > *this.limit {
                    return Poll::Ready(Err(Error::ResponseBodyLimit));
                }

                continue;
            }

            break;
        }

        Poll::Ready(Ok(mem::take(&mut self.aggregator).freeze()))
    }
}

pin_project! {
    /// Collects a response body into a UTF-8 string.
    pub struct TextFuture {
        #[pin]
        future: BytesFuture,
    }
}

impl Future for TextFuture {
    type Output = Result<String, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let bytes = ready!(this.future.poll(cx))?;
        Poll::Ready(String::from_utf8(bytes.to_vec()).map_err(Error::Utf8))
    }
}

pin_project! {
    /// Collects and deserializes a JSON response body.
    pub struct JsonFuture<T> {
        #[pin]
        future: BytesFuture,
        _phantom: PhantomData<T>,
    }
}

impl<T: DeserializeOwned> Future for JsonFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let bytes = ready!(this.future.poll(cx))?;
        Poll::Ready(serde_json::from_slice(&bytes).map_err(Error::Json))
    }
}

/// Size limited versions of `bytes`, `text` and `json` on [Response].
pub trait ResponseExt {
    /// Collect the body, failing with [Error::ResponseBodyLimit] past `limit`.
    fn bytes_limited(self, limit: usize) -> BytesFuture;
    /// Like [ResponseExt::bytes_limited], decoding UTF-8.
    fn text_limited(self, limit: usize) -> TextFuture;
    /// Like [ResponseExt::bytes_limited], deserializing JSON.
    fn json_limited<T: DeserializeOwned>(self, limit: usize) -> JsonFuture<T>;
}

impl ResponseExt for Response {
    fn bytes_limited(self, limit: usize) -> BytesFuture {
        BytesFuture {
            stream: Box::pin(self.bytes_stream()),
            limit,
            aggregator: BytesMut::new(),
        }
    }

    fn text_limited(self, limit: usize) -> TextFuture {
        TextFuture {
            future: self.bytes_limited(limit),
        }
    }

    fn json_limited<T: DeserializeOwned>(self, limit: usize) -> JsonFuture<T> {
        JsonFuture {
            future: self.bytes_limited(limit),
            _phantom: PhantomData,
        }
    }
}
