use bytes::{Buf, Bytes, BytesMut};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};
use weir_h2::{
    nom, parse_bit_and_u31, DataFlags, FrameHeader, FrameKind, FrameType, GoAway, HeadersFlags,
    PrioritySpec, RstStream, Settings, SettingsError, StreamId, WindowUpdate, FRAME_HEADER_LEN,
    PREFACE,
};
use weir_hpack::decoder::DecoderOrCallbackError;

use super::frame::Frame;
use crate::{
    error::{CompressionError, Direction, ErrorLevel, SessionError, StreamError},
    meta::MetaDataBuilder,
    Role,
};

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the client preface (servers only)
    Preface,
    /// Waiting for a 9-byte frame header
    Header,
    /// Waiting for the payload of this frame
    Payload(FrameHeader),
    /// A session error was returned, nothing more will be parsed
    Failed,
}

/// What the header block being reassembled will turn into
#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Headers {
        priority: Option<PrioritySpec>,
        end_stream: bool,
    },
    PushPromise {
        promised_stream_id: StreamId,
    },
}

#[derive(Debug)]
struct PendingBlock {
    stream_id: StreamId,
    kind: BlockKind,
    fragments: SmallVec<[Bytes; 2]>,
    len: usize,
}

/// Turns bytes into [Frame]s. Resumable: partial input stays in the
/// caller's buffer, and [Parser::parse] picks up where it left off once more
/// bytes arrived.
///
/// Owns the HPACK decoder and the [MetaDataBuilder] for the connection, so
/// header blocks come out decoded. CONTINUATION frames are reassembled and
/// never surface.
#[derive(Debug)]
pub struct Parser {
    state: State,
    max_frame_size: u32,
    enable_push: bool,
    decoder: weir_hpack::Decoder,
    builder: MetaDataBuilder,
    pending: Option<PendingBlock>,
}

impl Parser {
    /// A server parser expects the client preface first. `settings` are the
    /// limits we announce.
    pub fn new(role: Role, settings: &Settings) -> Self {
        let (state, inbound) = match role {
            Role::Server => (State::Preface, Direction::Request),
            Role::Client => (State::Header, Direction::Response),
        };
        Self {
            state,
            max_frame_size: settings.max_frame_size,
            // servers never accept pushes
            enable_push: role == Role::Client && settings.enable_push,
            // the table size we announce applies once the peer acknowledges it
            decoder: weir_hpack::Decoder::new(),
            builder: MetaDataBuilder::new(settings.max_header_list_size as usize, inbound),
            pending: None,
        }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn set_max_header_list_size(&mut self, size: u32) {
        self.builder.set_max_size(size as usize);
    }

    pub fn set_header_table_size(&mut self, size: u32) {
        self.decoder.set_max_allowed_table_size(size as usize);
    }

    pub fn set_enable_push(&mut self, enable_push: bool) {
        self.enable_push = enable_push;
    }

    /// Whether a header block is half-received, waiting for CONTINUATION
    pub fn in_header_block(&self) -> bool {
        self.pending.is_some()
    }

    /// Parses the next frame out of `buf`, consuming its bytes. `Ok(None)`
    /// means more input is needed.
    ///
    /// After a stream error the offending frame has been consumed and
    /// parsing can go on. After a session error, this only ever returns
    /// `Ok(None)`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ErrorLevel> {
        loop {
            match self.state {
                State::Failed => return Ok(None),
                State::Preface => match weir_h2::preface(&buf[..]) {
                    Ok(_) => {
                        buf.advance(PREFACE.len());
                        self.state = State::Header;
                        return Ok(Some(Frame::Preface));
                    }
                    Err(nom::Err::Incomplete(_)) => return Ok(None),
                    Err(_) => return Err(self.fail(SessionError::BadPreface)),
                },
                State::Header => {
                    if buf.len() < FRAME_HEADER_LEN {
                        return Ok(None);
                    }
                    let header = match FrameHeader::parse(&buf[..FRAME_HEADER_LEN]) {
                        Ok((_, header)) => header,
                        Err(_) => return Ok(None),
                    };
                    trace!(?header, "parsed frame header");

                    if header.len > self.max_frame_size {
                        return Err(self.fail(SessionError::FrameTooLarge {
                            frame_kind: header.frame_type.kind(),
                            frame_size: header.len,
                            max_frame_size: self.max_frame_size,
                        }));
                    }
                    buf.advance(FRAME_HEADER_LEN);
                    self.state = State::Payload(header);
                }
                State::Payload(header) => {
                    if buf.len() < header.len as usize {
                        return Ok(None);
                    }
                    let payload = buf.split_to(header.len as usize).freeze();
                    self.state = State::Header;

                    match self.parse_payload(header, payload) {
                        Ok(Some(frame)) => return Ok(Some(frame)),
                        Ok(None) => continue,
                        Err(ErrorLevel::Session(e)) => return Err(self.fail(e)),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn fail(&mut self, error: SessionError) -> ErrorLevel {
        debug!(%error, "parser failed");
        self.state = State::Failed;
        self.pending = None;
        error.into()
    }

    fn parse_payload(
        &mut self,
        header: FrameHeader,
        payload: Bytes,
    ) -> Result<Option<Frame>, ErrorLevel> {
        let stream_id = header.stream_id;

        if let Some(pending) = &self.pending {
            match header.frame_type {
                FrameType::Continuation(_) if stream_id == pending.stream_id => {}
                FrameType::Continuation(_) => {
                    return Err(SessionError::ExpectedContinuationForStream {
                        stream_id: pending.stream_id,
                        continuation_stream_id: stream_id,
                    }
                    .into())
                }
                frame_type => {
                    return Err(SessionError::ExpectedContinuationFrame {
                        stream_id: pending.stream_id,
                        frame_kind: frame_type.kind(),
                    }
                    .into())
                }
            }
        }

        match header.frame_type {
            FrameType::Data(flags) => {
                require_stream(FrameKind::Data, stream_id)?;
                let (data, padding) = strip_padding(FrameKind::Data, &header, payload)?;
                Ok(Some(Frame::Data {
                    stream_id,
                    data,
                    end_stream: flags.contains(DataFlags::EndStream),
                    padding,
                }))
            }
            FrameType::Headers(flags) => {
                require_stream(FrameKind::Headers, stream_id)?;
                let (mut block, _) = strip_padding(FrameKind::Headers, &header, payload)?;
                let priority = if flags.contains(HeadersFlags::Priority) {
                    let (_, spec) = PrioritySpec::parse(&block[..]).map_err(|_| {
                        SessionError::InvalidFrameLength {
                            frame_kind: FrameKind::Headers,
                            len: header.len,
                        }
                    })?;
                    block.advance(PrioritySpec::LEN);
                    Some(spec)
                } else {
                    None
                };
                let kind = BlockKind::Headers {
                    priority,
                    end_stream: flags.contains(HeadersFlags::EndStream),
                };
                self.start_block(stream_id, kind, block, header.is_end_headers())
            }
            FrameType::Priority => {
                require_stream(FrameKind::Priority, stream_id)?;
                let spec = match PrioritySpec::parse(&payload[..]) {
                    Ok((rest, spec)) if rest.is_empty() => spec,
                    _ => {
                        return Err(ErrorLevel::Stream(
                            stream_id,
                            StreamError::InvalidPriorityFrameSize {
                                frame_size: header.len,
                            },
                        ))
                    }
                };
                if spec.stream_dependency == stream_id {
                    return Err(ErrorLevel::Stream(
                        stream_id,
                        StreamError::SelfDependency { stream_id },
                    ));
                }
                Ok(Some(Frame::Priority { stream_id, spec }))
            }
            FrameType::RstStream => {
                require_stream(FrameKind::RstStream, stream_id)?;
                require_len(FrameKind::RstStream, &header, 4)?;
                let (_, rst) = RstStream::parse(&payload[..]).map_err(|_| bad_len(&header))?;
                Ok(Some(Frame::RstStream {
                    stream_id,
                    error_code: rst.error_code,
                }))
            }
            FrameType::Settings(_) => {
                require_connection(FrameKind::Settings, stream_id)?;
                let ack = header.is_ack();
                if (ack && header.len != 0) || header.len % 6 != 0 {
                    return Err(bad_len(&header).into());
                }

                let mut values = Vec::with_capacity(payload.len() / 6);
                let mut scratch = Settings::default();
                Settings::parse(&payload[..], |setting, value| {
                    scratch.apply(setting, value)?;
                    values.push((setting, value));
                    Ok::<_, SettingsError>(())
                })
                .map_err(SessionError::from)?;
                Ok(Some(Frame::Settings { ack, values }))
            }
            FrameType::PushPromise(_) => {
                require_stream(FrameKind::PushPromise, stream_id)?;
                if !self.enable_push {
                    return Err(SessionError::PushPromiseNotAllowed.into());
                }
                let (mut block, _) = strip_padding(FrameKind::PushPromise, &header, payload)?;
                let (_, (_, promised)) =
                    parse_bit_and_u31(&block[..]).map_err(|_| bad_len(&header))?;
                block.advance(4);
                let kind = BlockKind::PushPromise {
                    promised_stream_id: StreamId(promised),
                };
                self.start_block(stream_id, kind, block, header.is_end_headers())
            }
            FrameType::Ping(_) => {
                require_connection(FrameKind::Ping, stream_id)?;
                require_len(FrameKind::Ping, &header, 8)?;
                let mut payload_bytes = [0u8; 8];
                payload_bytes.copy_from_slice(&payload[..]);
                Ok(Some(Frame::Ping {
                    ack: header.is_ack(),
                    payload: payload_bytes,
                }))
            }
            FrameType::GoAway => {
                require_connection(FrameKind::GoAway, stream_id)?;
                let (_, go_away) = GoAway::parse(&payload[..]).map_err(|_| bad_len(&header))?;
                Ok(Some(Frame::GoAway {
                    last_stream_id: go_away.last_stream_id,
                    error_code: go_away.error_code,
                    debug_data: go_away.additional_debug_data,
                }))
            }
            FrameType::WindowUpdate => {
                require_len(FrameKind::WindowUpdate, &header, 4)?;
                let (_, update) =
                    WindowUpdate::parse(&payload[..]).map_err(|_| bad_len(&header))?;
                if update.increment == 0 {
                    return Err(if stream_id == StreamId::CONNECTION {
                        SessionError::WindowUpdateZeroIncrement.into()
                    } else {
                        ErrorLevel::Stream(stream_id, StreamError::WindowUpdateZeroIncrement)
                    });
                }
                Ok(Some(Frame::WindowUpdate {
                    stream_id,
                    increment: update.increment,
                }))
            }
            FrameType::Continuation(_) => {
                require_stream(FrameKind::Continuation, stream_id)?;
                let Some(pending) = self.pending.as_mut() else {
                    return Err(SessionError::UnexpectedContinuationFrame { stream_id }.into());
                };
                pending.len += payload.len();
                pending.fragments.push(payload);
                self.check_block_size()?;

                if !header.is_end_headers() {
                    return Ok(None);
                }
                let Some(pending) = self.pending.take() else {
                    return Ok(None);
                };
                let mut block = BytesMut::with_capacity(pending.len);
                for fragment in &pending.fragments {
                    block.extend_from_slice(fragment);
                }
                self.decode_block(pending.stream_id, pending.kind, &block)
                    .map(Some)
            }
            FrameType::Unknown(ft) => {
                trace!(
                    ty = ft.ty,
                    flags = ft.flags,
                    "skipping unknown frame: {}",
                    pretty_hex::simple_hex(&payload.slice(..payload.len().min(32)))
                );
                Ok(None)
            }
        }
    }

    fn start_block(
        &mut self,
        stream_id: StreamId,
        kind: BlockKind,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<Option<Frame>, ErrorLevel> {
        if end_headers {
            return self.decode_block(stream_id, kind, &fragment).map(Some);
        }

        self.pending = Some(PendingBlock {
            stream_id,
            kind,
            len: fragment.len(),
            fragments: smallvec![fragment],
        });
        self.check_block_size()?;
        Ok(None)
    }

    /// The encoded block is no bigger than what it decodes to, so once the
    /// fragments alone are past the limit there's no point waiting for the
    /// rest.
    fn check_block_size(&self) -> Result<(), SessionError> {
        match &self.pending {
            Some(pending) if pending.len > self.builder.max_size() => {
                Err(SessionError::HeaderListTooLarge {
                    size: pending.len,
                    max: self.builder.max_size(),
                })
            }
            _ => Ok(()),
        }
    }

    fn decode_block(
        &mut self,
        stream_id: StreamId,
        kind: BlockKind,
        block: &[u8],
    ) -> Result<Frame, ErrorLevel> {
        let builder = &mut self.builder;
        builder.reset();

        match self
            .decoder
            .decode_with_cb(block, |name, value| builder.emit(&name, &value))
        {
            Ok(()) => {}
            Err(DecoderOrCallbackError::DecoderError(e)) => {
                return Err(SessionError::from(CompressionError::from(e)).into())
            }
            Err(DecoderOrCallbackError::CallbackError(e)) => return Err(e.into()),
        }

        let meta = self
            .builder
            .build()
            .map_err(|e| ErrorLevel::Stream(stream_id, e))?;

        Ok(match kind {
            BlockKind::Headers {
                priority,
                end_stream,
            } => Frame::Headers {
                stream_id,
                meta,
                priority,
                end_stream,
            },
            BlockKind::PushPromise { promised_stream_id } => Frame::PushPromise {
                stream_id,
                promised_stream_id,
                meta,
            },
        })
    }
}

fn require_stream(frame_kind: FrameKind, stream_id: StreamId) -> Result<(), SessionError> {
    if stream_id == StreamId::CONNECTION {
        return Err(SessionError::StreamSpecificFrameToConnection { frame_kind });
    }
    Ok(())
}

fn require_connection(frame_kind: FrameKind, stream_id: StreamId) -> Result<(), SessionError> {
    if stream_id != StreamId::CONNECTION {
        return Err(SessionError::ConnectionFrameToStream {
            frame_kind,
            stream_id,
        });
    }
    Ok(())
}

fn require_len(frame_kind: FrameKind, header: &FrameHeader, len: u32) -> Result<(), SessionError> {
    if header.len != len {
        return Err(SessionError::InvalidFrameLength {
            frame_kind,
            len: header.len,
        });
    }
    Ok(())
}

fn bad_len(header: &FrameHeader) -> SessionError {
    SessionError::InvalidFrameLength {
        frame_kind: header.frame_type.kind().unwrap_or(FrameKind::Data),
        len: header.len,
    }
}

/// Returns the payload without its padding, and how many octets of padding
/// (pad length octet included) there were.
fn strip_padding(
    frame_kind: FrameKind,
    header: &FrameHeader,
    mut payload: Bytes,
) -> Result<(Bytes, u16), SessionError> {
    if !header.is_padded() {
        return Ok((payload, 0));
    }
    if payload.is_empty() {
        return Err(SessionError::PaddedFrameEmpty { frame_kind });
    }

    let padding_length = payload.get_u8() as usize;
    if padding_length > payload.len() {
        return Err(SessionError::PaddedFrameTooShort {
            frame_kind,
            padding_length,
            frame_size: header.len,
        });
    }
    payload.truncate(payload.len() - padding_length);
    Ok((payload, padding_length as u16 + 1))
}
