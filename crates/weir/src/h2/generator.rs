use std::io;

use bytes::{BufMut, BytesMut};
use tracing::trace;
use weir_h2::{
    enumflags2::BitFlags, pack_bit_and_u31, ContinuationFlags, DataFlags, FrameHeader, FrameKind,
    FrameType, GoAway, HeadersFlags, PingFlags, PrioritySpec, PushPromiseFlags, RstStream, Setting,
    SettingPairs, Settings, SettingsFlags, StreamId, WindowUpdate, PREFACE,
};

use super::frame::Frame;
use crate::{error::StreamError, meta::MetaData, Role};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GenerateError {
    #[error("error writing frame: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("{0:?} frames are never generated directly")]
    NotGenerated(FrameKind),
}

/// Turns [Frame]s into bytes, owning the HPACK encoder for the connection.
#[derive(Debug)]
pub struct Generator {
    role: Role,
    encoder: weir_hpack::Encoder,

    /// The peer's SETTINGS_MAX_FRAME_SIZE
    max_frame_size: u32,

    /// The peer's SETTINGS_MAX_HEADER_LIST_SIZE
    max_header_list_size: u32,

    /// Header blocks are split in fragments of at most this size
    max_header_fragment_size: Option<usize>,

    scratch: Vec<u8>,
}

impl Generator {
    pub fn new(role: Role) -> Self {
        let defaults = Settings::default();
        Self {
            role,
            encoder: Default::default(),
            max_frame_size: defaults.max_frame_size,
            max_header_list_size: defaults.max_header_list_size,
            max_header_fragment_size: None,
            scratch: Default::default(),
        }
    }

    pub fn set_header_table_size(&mut self, size: u32) {
        self.encoder.set_max_table_size(size as usize);
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn set_max_header_list_size(&mut self, size: u32) {
        self.max_header_list_size = size;
    }

    pub fn set_max_header_fragment_size(&mut self, size: Option<usize>) {
        self.max_header_fragment_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Writes the connection preface: the magic (clients only), then our
    /// initial SETTINGS.
    pub fn generate_preface(
        &mut self,
        buf: &mut BytesMut,
        settings: &[(Setting, u32)],
    ) -> Result<usize, GenerateError> {
        let start = buf.len();
        if self.role == Role::Client {
            buf.put_slice(PREFACE);
        }
        self.generate(
            buf,
            &Frame::Settings {
                ack: false,
                values: settings.to_vec(),
            },
        )?;
        Ok(buf.len() - start)
    }

    /// Serializes `frame` onto the end of `buf`, returning the number of
    /// bytes written. Header blocks larger than the fragment size are
    /// followed by CONTINUATION frames.
    pub fn generate(&mut self, buf: &mut BytesMut, frame: &Frame) -> Result<usize, GenerateError> {
        let start = buf.len();

        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                padding,
            } => {
                let mut flags = BitFlags::<DataFlags>::empty();
                if *end_stream {
                    flags |= DataFlags::EndStream;
                }
                if *padding > 0 {
                    flags |= DataFlags::Padded;
                }
                let len = data.len() + *padding as usize;
                FrameHeader::new(FrameType::Data(flags), *stream_id)
                    .with_len(len as u32)
                    .write_into((&mut *buf).writer())?;
                if *padding > 0 {
                    buf.put_u8((*padding - 1) as u8);
                    buf.put_slice(data);
                    buf.put_bytes(0, (*padding - 1) as usize);
                } else {
                    buf.put_slice(data);
                }
            }
            Frame::Headers {
                stream_id,
                meta,
                priority,
                end_stream,
            } => {
                let mut prefix = [0u8; PrioritySpec::LEN];
                let prefix = match priority {
                    Some(spec) => {
                        spec.write_into(&mut prefix[..])?;
                        &prefix[..]
                    }
                    None => &prefix[..0],
                };
                self.write_block(buf, *stream_id, meta, prefix, |end_headers| {
                    let mut flags = BitFlags::<HeadersFlags>::empty();
                    if end_headers {
                        flags |= HeadersFlags::EndHeaders;
                    }
                    if *end_stream {
                        flags |= HeadersFlags::EndStream;
                    }
                    if priority.is_some() {
                        flags |= HeadersFlags::Priority;
                    }
                    FrameType::Headers(flags)
                })?;
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                meta,
            } => {
                let prefix = pack_bit_and_u31(0, promised_stream_id.0);
                self.write_block(buf, *stream_id, meta, &prefix, |end_headers| {
                    let mut flags = BitFlags::<PushPromiseFlags>::empty();
                    if end_headers {
                        flags |= PushPromiseFlags::EndHeaders;
                    }
                    FrameType::PushPromise(flags)
                })?;
            }
            Frame::Priority { stream_id, spec } => {
                FrameHeader::new(FrameType::Priority, *stream_id)
                    .with_len(PrioritySpec::LEN as u32)
                    .write_into((&mut *buf).writer())?;
                spec.write_into((&mut *buf).writer())?;
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                FrameHeader::new(FrameType::RstStream, *stream_id)
                    .with_len(4)
                    .write_into((&mut *buf).writer())?;
                RstStream {
                    error_code: *error_code,
                }
                .write_into((&mut *buf).writer())?;
            }
            Frame::Settings { ack, values } => {
                let flags = if *ack {
                    SettingsFlags::Ack.into()
                } else {
                    BitFlags::empty()
                };
                let pairs = SettingPairs(if *ack { &[] } else { &values[..] });
                FrameHeader::new(FrameType::Settings(flags), StreamId::CONNECTION)
                    .with_len(pairs.encoded_len() as u32)
                    .write_into((&mut *buf).writer())?;
                pairs.write_into((&mut *buf).writer())?;
            }
            Frame::Ping { ack, payload } => {
                let flags = if *ack {
                    PingFlags::Ack.into()
                } else {
                    BitFlags::empty()
                };
                FrameHeader::new(FrameType::Ping(flags), StreamId::CONNECTION)
                    .with_len(8)
                    .write_into((&mut *buf).writer())?;
                buf.put_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                FrameHeader::new(FrameType::GoAway, StreamId::CONNECTION)
                    .with_len(8 + debug_data.len() as u32)
                    .write_into((&mut *buf).writer())?;
                GoAway {
                    last_stream_id: *last_stream_id,
                    error_code: *error_code,
                    additional_debug_data: debug_data.clone(),
                }
                .write_into((&mut *buf).writer())?;
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                FrameHeader::new(FrameType::WindowUpdate, *stream_id)
                    .with_len(4)
                    .write_into((&mut *buf).writer())?;
                WindowUpdate {
                    reserved: 0,
                    increment: *increment,
                }
                .write_into((&mut *buf).writer())?;
            }
            Frame::Continuation { .. }
            | Frame::Preface
            | Frame::Disconnect
            | Frame::Failure { .. } => return Err(GenerateError::NotGenerated(frame.kind())),
        }

        Ok(buf.len() - start)
    }

    /// Writes DATA frames for as much of `data` as fits in `max_len` (the
    /// available flow-control window), each at most the peer's max frame
    /// size. END_STREAM is only set if all of `data` went out. Returns how
    /// many bytes of `data` were written.
    pub fn generate_data(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        data: &[u8],
        end_stream: bool,
        max_len: usize,
    ) -> Result<usize, GenerateError> {
        let len = data.len().min(max_len);
        let mut written = 0;

        loop {
            let chunk_len = (len - written).min(self.max_frame_size as usize);
            let last = written + chunk_len == len;
            let end = end_stream && last && len == data.len();
            if chunk_len == 0 && !end {
                break;
            }

            let flags = if end {
                DataFlags::EndStream.into()
            } else {
                BitFlags::empty()
            };
            FrameHeader::new(FrameType::Data(flags), stream_id)
                .with_len(chunk_len as u32)
                .write_into((&mut *buf).writer())?;
            buf.put_slice(&data[written..written + chunk_len]);
            written += chunk_len;

            if last {
                break;
            }
        }

        Ok(written)
    }

    fn write_block(
        &mut self,
        buf: &mut BytesMut,
        stream_id: StreamId,
        meta: &MetaData,
        prefix: &[u8],
        first_frame_type: impl FnOnce(bool) -> FrameType,
    ) -> Result<(), GenerateError> {
        let fields = meta.to_fields();

        // checked before encoding, so a refused block leaves the encoder's
        // table untouched
        let size: usize = fields
            .iter()
            .map(|(name, value)| weir_hpack::entry_size(name, value))
            .sum();
        if size > self.max_header_list_size as usize {
            return Err(StreamError::HeaderListTooLarge {
                size,
                max: self.max_header_list_size as usize,
            }
            .into());
        }

        self.scratch.clear();
        self.encoder.encode_into(
            fields.iter().map(|(name, value)| (*name, value.as_ref())),
            &mut self.scratch,
        );

        let max_frame_size = self.max_frame_size as usize;
        let fragment_size = self
            .max_header_fragment_size
            .unwrap_or(max_frame_size)
            .clamp(prefix.len() + 1, max_frame_size);

        let block = &self.scratch[..];
        let (first, rest) = block.split_at(block.len().min(fragment_size - prefix.len()));
        trace!(%stream_id, block_len = block.len(), continuations = rest.len().div_ceil(fragment_size), "writing header block");

        FrameHeader::new(first_frame_type(rest.is_empty()), stream_id)
            .with_len((prefix.len() + first.len()) as u32)
            .write_into((&mut *buf).writer())?;
        buf.put_slice(prefix);
        buf.put_slice(first);

        let mut chunks = rest.chunks(fragment_size).peekable();
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                ContinuationFlags::EndHeaders.into()
            } else {
                BitFlags::empty()
            };
            FrameHeader::new(FrameType::Continuation(flags), stream_id)
                .with_len(chunk.len() as u32)
                .write_into((&mut *buf).writer())?;
            buf.put_slice(chunk);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{header, HeaderValue, Method, StatusCode};
    use pretty_assertions::assert_eq;
    use weir_h2::{ErrorCode, KnownErrorCode};

    use crate::meta::{Request, Response};

    fn header_at(buf: &[u8]) -> FrameHeader {
        FrameHeader::parse(buf).unwrap().1
    }

    #[test]
    fn test_preface_client_and_server() {
        let mut buf = BytesMut::new();
        let mut client = Generator::new(Role::Client);
        client
            .generate_preface(&mut buf, &[(Setting::EnablePush, 0)])
            .unwrap();
        assert_eq!(&buf[..PREFACE.len()], PREFACE);
        let header = header_at(&buf[PREFACE.len()..]);
        assert_eq!(header.frame_type, FrameType::Settings(BitFlags::empty()));
        assert_eq!(header.len, 6);

        let mut buf = BytesMut::new();
        let mut server = Generator::new(Role::Server);
        server.generate_preface(&mut buf, &[]).unwrap();
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_fixed_size_frames() {
        let mut g = Generator::new(Role::Server);
        let mut buf = BytesMut::new();

        let n = g
            .generate(
                &mut buf,
                &Frame::RstStream {
                    stream_id: StreamId(3),
                    error_code: KnownErrorCode::Cancel.into(),
                },
            )
            .unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf[..], &[0, 0, 4, 3, 0, 0, 0, 0, 3, 0, 0, 0, 8]);

        buf.clear();
        g.generate(
            &mut buf,
            &Frame::GoAway {
                last_stream_id: StreamId(7),
                error_code: ErrorCode(0),
                debug_data: Bytes::from_static(b"bye"),
            },
        )
        .unwrap();
        assert_eq!(header_at(&buf).len, 11);
        assert_eq!(&buf[9..13], &[0, 0, 0, 7]);
        assert_eq!(&buf[17..], b"bye");
    }

    #[test]
    fn test_data_split_by_frame_size_and_window() {
        let mut g = Generator::new(Role::Client);
        let mut buf = BytesMut::new();
        let data = vec![b'x'; 40_000];

        // the window only allows 20000 bytes: two frames, no END_STREAM
        let n = g
            .generate_data(&mut buf, StreamId(1), &data, true, 20_000)
            .unwrap();
        assert_eq!(n, 20_000);
        let first = header_at(&buf);
        assert_eq!(first.len, 16384);
        assert!(!first.is_end_stream());
        let second = header_at(&buf[9 + 16384..]);
        assert_eq!(second.len, 20_000 - 16384);
        assert!(!second.is_end_stream());

        buf.clear();
        let n = g
            .generate_data(&mut buf, StreamId(1), &data[n..], true, usize::MAX)
            .unwrap();
        assert_eq!(n, 20_000);
        let second = header_at(&buf[9 + 16384..]);
        assert!(second.is_end_stream());
    }

    #[test]
    fn test_data_empty_end_stream() {
        let mut g = Generator::new(Role::Client);
        let mut buf = BytesMut::new();
        assert_eq!(g.generate_data(&mut buf, StreamId(1), b"", true, 0).unwrap(), 0);
        let header = header_at(&buf);
        assert_eq!(header.len, 0);
        assert!(header.is_end_stream());

        // nothing to say and no window: nothing written
        buf.clear();
        assert_eq!(g.generate_data(&mut buf, StreamId(1), b"abc", true, 0).unwrap(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_headers_split_into_continuations() {
        let mut g = Generator::new(Role::Server);
        g.set_max_header_fragment_size(Some(64));

        let mut res = Response::new(StatusCode::OK);
        for i in 0..10 {
            res = res.with_header(
                header::HeaderName::from_bytes(format!("x-custom-{i}").as_bytes()).unwrap(),
                HeaderValue::from_static("some fairly long value, to fill the block"),
            );
        }
        let mut buf = BytesMut::new();
        g.generate(
            &mut buf,
            &Frame::Headers {
                stream_id: StreamId(1),
                meta: MetaData::Response(res),
                priority: None,
                end_stream: true,
            },
        )
        .unwrap();

        let mut pos = 0;
        let mut headers = Vec::new();
        while pos < buf.len() {
            let header = header_at(&buf[pos..]);
            pos += 9 + header.len as usize;
            headers.push(header);
        }
        assert!(headers.len() > 2);
        assert!(matches!(headers[0].frame_type, FrameType::Headers(_)));
        assert!(headers[0].is_end_stream());
        assert!(!headers[0].is_end_headers());
        for header in &headers[1..headers.len() - 1] {
            assert!(matches!(header.frame_type, FrameType::Continuation(_)));
            assert!(!header.is_end_headers());
            assert_eq!(header.len, 64);
        }
        assert!(headers[headers.len() - 1].is_end_headers());
    }

    #[test]
    fn test_headers_over_peer_limit_are_refused() {
        let mut g = Generator::new(Role::Client);
        g.set_max_header_list_size(64);
        let req = Request::new(Method::GET, "https://example.org/".parse().unwrap()).with_header(
            header::COOKIE,
            HeaderValue::from_static("a-very-long-cookie-value-that-goes-past-the-limit"),
        );
        let mut buf = BytesMut::new();
        let err = g
            .generate(
                &mut buf,
                &Frame::Headers {
                    stream_id: StreamId(1),
                    meta: MetaData::Request(req),
                    priority: None,
                    end_stream: true,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            GenerateError::Stream(StreamError::HeaderListTooLarge { max: 64, .. })
        ));
        assert!(buf.is_empty());
        assert!(g.encoder.dynamic_table().is_empty());
    }

    #[test]
    fn test_synthetic_frames_are_not_generated() {
        let mut g = Generator::new(Role::Client);
        let mut buf = BytesMut::new();
        assert!(matches!(
            g.generate(&mut buf, &Frame::Disconnect),
            Err(GenerateError::NotGenerated(FrameKind::Disconnect))
        ));
    }
}
