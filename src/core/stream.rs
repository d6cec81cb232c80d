//! Byte-level package IO with the transport's cancellation and timeout
//! policy.
//!
//! The first byte of every frame may pend indefinitely and honors the
//! caller-supplied cancellation token; every later byte class (header
//! remainder, payload) gets a fresh receive-timeout deadline. Frames of
//! type `Error` surface as [`TransportError::ErrorPackage`] after being
//! consumed in full.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use crate::core::codec::PackageCodec;
use crate::core::package::{check_payload_len, Package, PackageType};
use crate::error::{Result, TransportError};
use crate::utils::timeout::with_deadline;

fn map_read_error(err: std::io::Error) -> TransportError {
    if err.kind() == ErrorKind::UnexpectedEof {
        TransportError::Disconnected
    } else {
        TransportError::CannotRead
    }
}

/// Reading half of a package stream.
pub struct PackageReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    receive_timeout: Duration,
}

impl PackageReader {
    pub fn new<R>(inner: R, receive_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(inner),
            receive_timeout,
        }
    }

    /// Read the package-type tag of the next frame.
    ///
    /// Pends until a byte arrives; safe to race in a `select!` because no
    /// byte has been consumed while the future is still pending.
    pub(crate) async fn read_tag(&mut self) -> Result<u8> {
        let mut tag = [0u8; 1];
        self.inner
            .read_exact(&mut tag)
            .await
            .map_err(map_read_error)?;
        Ok(tag[0])
    }

    /// Read the remainder of a frame whose type tag has already been
    /// consumed. Each byte class gets its own receive-timeout deadline.
    pub(crate) async fn read_body(&mut self, type_tag: u8) -> Result<Package> {
        let mut rest = [0u8; 5];
        self.read_timed(&mut rest).await?;

        let mut raw_len = [0u8; 4];
        raw_len.copy_from_slice(&rest[1..5]);
        let payload_len = check_payload_len(i32::from_be_bytes(raw_len))?;

        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 {
            self.read_timed(&mut payload).await?;
        }

        let pkg = Package::from_wire_parts(type_tag, rest[0], payload)?;
        if pkg.package_type == PackageType::Error {
            return Err(TransportError::ErrorPackage);
        }
        Ok(pkg)
    }

    /// Read one complete frame. The cancellation token is honored on the
    /// first byte only.
    pub async fn read_package(&mut self, cancel: &CancellationToken) -> Result<Package> {
        let tag = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            tag = self.read_tag() => tag?,
        };
        self.read_body(tag).await
    }

    async fn read_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        with_deadline(self.receive_timeout, async {
            self.inner
                .read_exact(buf)
                .await
                .map(|_| ())
                .map_err(map_read_error)
        })
        .await
    }
}

/// Writing half of a package stream.
pub struct PackageWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    buf: BytesMut,
}

impl PackageWriter {
    pub fn new<W>(inner: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(inner),
            buf: BytesMut::new(),
        }
    }

    /// Write one complete frame and flush it.
    pub async fn write_package(&mut self, pkg: &Package) -> Result<()> {
        self.buf.clear();
        PackageCodec.encode(pkg, &mut self.buf)?;
        self.inner
            .write_all(&self.buf)
            .await
            .map_err(|_| TransportError::CannotWrite)?;
        self.inner
            .flush()
            .await
            .map_err(|_| TransportError::CannotWrite)
    }

    /// Best-effort shutdown of the write side.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::package::DataType;
    use std::time::Duration;

    fn pair() -> (PackageReader, PackageWriter) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_half, _w) = tokio::io::split(client);
        let (_r, write_half) = tokio::io::split(server);
        (
            PackageReader::new(read_half, Duration::from_millis(200)),
            PackageWriter::new(write_half),
        )
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (mut reader, mut writer) = pair();
        let cancel = CancellationToken::new();

        let pkg = Package::data_string("ok");
        writer.write_package(&pkg).await.unwrap();

        let decoded = reader.read_package(&cancel).await.unwrap();
        assert_eq!(decoded, pkg);
        assert_eq!(decoded.data_type, DataType::String);
    }

    #[tokio::test]
    async fn first_byte_honors_cancellation() {
        let (mut reader, _writer) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            reader.read_package(&cancel).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn partial_header_times_out() {
        let (client, server) = tokio::io::duplex(64);
        let (read_half, _keep_client_write) = tokio::io::split(client);
        let (_r, mut write_half) = tokio::io::split(server);
        let mut reader = PackageReader::new(read_half, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        // Only the type tag ever arrives.
        write_half.write_all(&[4u8]).await.unwrap();

        assert!(matches!(
            reader.read_package(&cancel).await,
            Err(TransportError::ReadTimeout)
        ));
    }

    #[tokio::test]
    async fn closed_stream_reads_as_disconnected() {
        let (mut reader, writer) = pair();
        let cancel = CancellationToken::new();
        drop(writer);

        assert!(matches!(
            reader.read_package(&cancel).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn error_frames_surface_as_error_package() {
        let (mut reader, mut writer) = pair();
        let cancel = CancellationToken::new();

        writer
            .write_package(&Package::internal(PackageType::Error))
            .await
            .unwrap();

        assert!(matches!(
            reader.read_package(&cancel).await,
            Err(TransportError::ErrorPackage)
        ));
    }
}
