//! RTP audio channel
//!
//! Packetizes captured PCM into RTP and turns received RTP back into a
//! PCM byte stream through a timestamp-addressed jitter buffer. DTMF
//! tones go out as RFC 4733 telephone events on the same stream.

use super::packet::{RtpError, RtpPacket};
use crate::infrastructure::media::audio::AudioFormat;
use crate::infrastructure::media::codec::{AudioCodec, PayloadType};
use bytes::{BufMut, Bytes, BytesMut};
use metrics::counter;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

const SAMPLE_BYTES: usize = 2;

/// Highest event code: `0`-`9`, `*`, `#`, `A`-`D`
pub const MAX_TONE: u8 = 15;
/// Event code for a keypad key
pub fn key_tone(key: char) -> Option<u8> {
    match key.to_ascii_uppercase() {
        '0'..='9' => key.to_digit(10).map(|digit| digit as u8),
        '*' => Some(10),
        '#' => Some(11),
        key @ 'A'..='D' => Some(12 + (key as u8 - b'A')),
        _ => None,
    }
}

/// Power level sent with events, in -dBm0
const TONE_VOLUME: u8 = 10;
/// End packets are sent this many times
const TONE_END_REPEATS: usize = 3;

/// Telephone event being sent
#[derive(Debug, Clone, Copy)]
struct ToneEvent {
    event: u8,
    /// Stamp of the event's first packet, kept by every update
    stamp: u32,
    duration: u32,
}

/// Packetization and jitter buffer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub ptime_ms: u32,
    /// Frames buffered before playback starts
    pub min_frames: usize,
    /// Frames after which the buffer is trimmed back to `min_frames`
    pub max_frames: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ptime_ms: 20,
            min_frames: 5,
            max_frames: 15,
        }
    }
}

pub struct RtpAudioChannel {
    config: ChannelConfig,
    local_payloads: Vec<PayloadType>,
    payload: Option<PayloadType>,
    codec: Option<Box<dyn AudioCodec>>,
    tone_payload: Option<PayloadType>,
    outgoing_tone: Option<ToneEvent>,

    incoming_buffer: Vec<u8>,
    incoming_buffering: bool,
    incoming_minimum: usize,
    incoming_maximum: usize,
    incoming_sequence: Option<u16>,
    incoming_stamp: u32,

    outgoing_buffer: Vec<u8>,
    outgoing_chunk: usize,
    outgoing_marker: bool,
    outgoing_sequence: u16,
    outgoing_stamp: u32,
    outbox: VecDeque<Bytes>,
}

impl RtpAudioChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let local_payloads = [
            PayloadType::pcmu(),
            PayloadType::pcma(),
            PayloadType::telephone_event(),
        ]
            .into_iter()
            .map(|mut payload| {
                payload.ptime = config.ptime_ms;
                payload
            })
            .collect();

        Self {
            config,
            local_payloads,
            payload: None,
            codec: None,
            tone_payload: None,
            outgoing_tone: None,
            incoming_buffer: Vec::new(),
            incoming_buffering: true,
            incoming_minimum: 0,
            incoming_maximum: 0,
            incoming_sequence: None,
            incoming_stamp: 0,
            outgoing_buffer: Vec::new(),
            outgoing_chunk: 0,
            outgoing_marker: true,
            outgoing_sequence: 0,
            outgoing_stamp: 0,
            outbox: VecDeque::new(),
        }
    }

    /// Payload types we offer, in preference order
    pub fn local_payload_types(&self) -> &[PayloadType] {
        &self.local_payloads
    }

    /// Negotiated payload type
    pub fn payload_type(&self) -> Option<&PayloadType> {
        self.payload.as_ref()
    }

    /// Negotiated telephone-event payload type, if the remote party takes them
    pub fn tone_payload_type(&self) -> Option<&PayloadType> {
        self.tone_payload.as_ref()
    }

    /// A codec has been negotiated
    pub fn is_open(&self) -> bool {
        self.codec.is_some()
    }

    /// PCM format of the negotiated payload
    pub fn audio_format(&self) -> Option<AudioFormat> {
        self.payload.as_ref().map(|p| AudioFormat {
            sample_rate: p.clockrate,
            channels: p.channels as u16,
        })
    }

    fn offers(&self, candidate: &PayloadType) -> bool {
        self.local_payloads.iter().any(|local| local.matches(candidate))
    }

    /// Select the first remote payload type we support.
    ///
    /// Returns `false` if none matches, leaving the channel closed. A
    /// telephone-event type at the codec's clock rate is picked up as well.
    pub fn set_remote_payload_types(&mut self, remote: &[PayloadType]) -> bool {
        let Some((candidate, codec)) = remote
            .iter()
            .filter(|candidate| self.offers(candidate))
            .find_map(|candidate| candidate.codec().map(|codec| (candidate, codec)))
        else {
            warn!("Could not find a common payload type");
            return false;
        };

        let chunk = candidate.frame_bytes();
        info!("RTP channel using {}", candidate.rtpmap());
        self.incoming_minimum = chunk * self.config.min_frames;
        self.incoming_maximum = chunk * self.config.max_frames;
        self.outgoing_chunk = chunk;
        self.tone_payload = remote
            .iter()
            .find(|t| t.is_telephone_event() && t.clockrate == candidate.clockrate && self.offers(t))
            .cloned();
        if let Some(tone) = &self.tone_payload {
            debug!("RTP channel sending tones as {}", tone.rtpmap());
        }
        self.payload = Some(candidate.clone());
        self.codec = Some(codec);
        true
    }

    fn tick_bytes(&self) -> usize {
        SAMPLE_BYTES * self.payload.as_ref().map_or(1, |p| p.channels.max(1) as usize)
    }

    /// Feed a datagram received on the RTP component
    pub fn datagram_received(&mut self, data: &[u8]) -> Result<(), RtpError> {
        let packet = RtpPacket::parse(data)?;
        let (Some(payload), Some(codec)) = (&self.payload, &self.codec) else {
            return Err(RtpError::NoCodec);
        };
        if self.tone_payload.as_ref().is_some_and(|t| t.id == packet.payload_type) {
            debug!("Ignoring received telephone event");
            return Ok(());
        }
        if packet.payload_type != payload.id {
            counter!("rtp_packets_dropped_total").increment(1);
            return Err(RtpError::UnexpectedPayloadType(packet.payload_type));
        }
        counter!("rtp_packets_received_total").increment(1);

        if let Some(last) = self.incoming_sequence {
            if packet.sequence != last.wrapping_add(1) {
                warn!("RTP packet seq {} is out of order", packet.sequence);
            }
        }
        self.incoming_sequence = Some(packet.sequence);

        let decoded = codec.decode(&packet.payload);
        let tick_bytes = self.tick_bytes();

        // position of the packet in the buffer
        let mut offset = 0usize;
        if self.incoming_buffer.is_empty() {
            self.incoming_stamp = packet.timestamp;
        } else {
            let delta = packet.timestamp.wrapping_sub(self.incoming_stamp) as i32;
            if delta < 0 {
                warn!("RTP packet stamp is too old");
                counter!("rtp_packets_dropped_total").increment(1);
                return Ok(());
            }
            offset = delta as usize * tick_bytes;
            if offset > self.incoming_maximum {
                debug!("RTP packet stamp jumped ahead, resynchronising");
                self.incoming_buffer.clear();
                self.incoming_stamp = packet.timestamp;
                offset = 0;
            }
        }

        let end = offset + decoded.len();
        if self.incoming_buffer.len() < end {
            self.incoming_buffer.resize(end, 0);
        }
        self.incoming_buffer[offset..end].copy_from_slice(&decoded);

        // bound the latency
        if self.incoming_buffer.len() > self.incoming_maximum {
            let excess = self.incoming_buffer.len() - self.incoming_minimum;
            let dropped = excess - excess % tick_bytes;
            warn!("Incoming RTP buffer is too full, dropping {} bytes", dropped);
            self.incoming_buffer.drain(..dropped);
            self.incoming_stamp = self
                .incoming_stamp
                .wrapping_add((dropped / tick_bytes) as u32);
        }

        if self.incoming_buffering && self.incoming_buffer.len() >= self.incoming_minimum {
            debug!("RTP channel finished buffering");
            self.incoming_buffering = false;
        }
        Ok(())
    }

    /// Bytes waiting in the jitter buffer
    pub fn buffered_bytes(&self) -> usize {
        self.incoming_buffer.len()
    }

    /// Jitter buffer contents
    pub fn incoming_buffer(&self) -> &[u8] {
        &self.incoming_buffer
    }

    /// RTP timestamp of the first buffered byte
    pub fn incoming_stamp(&self) -> u32 {
        self.incoming_stamp
    }

    pub fn is_buffering(&self) -> bool {
        self.incoming_buffering
    }

    /// Read up to `max` bytes of PCM for playback.
    ///
    /// Returns silence while the initial buffer fills; short reads are
    /// padded with silence.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let tick_bytes = self.tick_bytes();
        let size = max - max % tick_bytes;
        if self.incoming_buffering {
            return vec![0; size];
        }

        let available = size.min(self.incoming_buffer.len());
        let mut data: Vec<u8> = self.incoming_buffer.drain(..available).collect();
        if available < size {
            debug!("RTP channel missing {} bytes", size - available);
            data.resize(size, 0);
        }
        self.incoming_stamp = self.incoming_stamp.wrapping_add((size / tick_bytes) as u32);
        data
    }

    /// Queue captured PCM; every complete frame becomes an RTP packet
    pub fn write(&mut self, pcm: &[u8]) -> Result<(), RtpError> {
        let (Some(payload), Some(codec)) = (&self.payload, &self.codec) else {
            return Err(RtpError::NoCodec);
        };

        self.outgoing_buffer.extend_from_slice(pcm);
        let mut frames = 0u32;
        while self.outgoing_buffer.len() >= self.outgoing_chunk {
            let chunk: Vec<u8> = self.outgoing_buffer.drain(..self.outgoing_chunk).collect();

            self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
            let mut packet = RtpPacket::new(
                payload.id,
                self.outgoing_sequence,
                self.outgoing_stamp,
                0,
                codec.encode(&chunk),
            );
            packet.marker = std::mem::take(&mut self.outgoing_marker);

            let ticks = chunk.len() / (SAMPLE_BYTES * payload.channels.max(1) as usize);
            self.outgoing_stamp = self.outgoing_stamp.wrapping_add(ticks as u32);
            self.outbox.push_back(packet.serialize());
            counter!("rtp_packets_sent_total").increment(1);
            frames += 1;
        }

        // one event update per audio frame
        if let Some(mut tone) = self.outgoing_tone {
            let frame_ticks = (self.outgoing_chunk / self.tick_bytes()) as u32;
            for _ in 0..frames {
                tone.duration += frame_ticks;
                self.push_tone_packet(&tone, false, false);
            }
            self.outgoing_tone = Some(tone);
        }
        Ok(())
    }

    /// Start sending a DTMF tone as telephone events.
    ///
    /// Events are `0`-`9`, `*` (10), `#` (11) and `A`-`D` (12-15). A tone
    /// still playing is ended first.
    pub fn start_tone(&mut self, tone: u8) -> Result<(), RtpError> {
        if tone > MAX_TONE {
            return Err(RtpError::InvalidTone(tone));
        }
        if self.codec.is_none() {
            return Err(RtpError::NoCodec);
        }
        if self.tone_payload.is_none() {
            return Err(RtpError::NoTelephoneEvent);
        }

        if let Some(current) = self.outgoing_tone.take() {
            self.end_tone(&current);
        }
        debug!("RTP channel starting tone {}", tone);
        let event = ToneEvent {
            event: tone,
            stamp: self.outgoing_stamp,
            duration: 0,
        };
        self.push_tone_packet(&event, true, false);
        self.outgoing_tone = Some(event);
        Ok(())
    }

    /// Stop sending `tone`; other tones are left alone
    pub fn stop_tone(&mut self, tone: u8) {
        match self.outgoing_tone {
            Some(current) if current.event == tone => {
                debug!("RTP channel stopping tone {}", tone);
                self.outgoing_tone = None;
                self.end_tone(&current);
            }
            _ => {}
        }
    }

    fn end_tone(&mut self, tone: &ToneEvent) {
        for _ in 0..TONE_END_REPEATS {
            self.push_tone_packet(tone, false, true);
        }
    }

    fn push_tone_packet(&mut self, tone: &ToneEvent, marker: bool, end: bool) {
        let Some(payload) = &self.tone_payload else {
            return;
        };

        let mut body = BytesMut::with_capacity(4);
        body.put_u8(tone.event);
        body.put_u8((if end { 0x80 } else { 0 }) | TONE_VOLUME);
        body.put_u16(tone.duration.min(u32::from(u16::MAX)) as u16);

        self.outgoing_sequence = self.outgoing_sequence.wrapping_add(1);
        let mut packet = RtpPacket::new(payload.id, self.outgoing_sequence, tone.stamp, 0, body.freeze());
        packet.marker = marker;
        self.outbox.push_back(packet.serialize());
        counter!("rtp_packets_sent_total").increment(1);
    }

    /// Next RTP datagram to send
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    /// Drop buffered audio in both directions
    pub fn close(&mut self) {
        self.incoming_buffer.clear();
        self.outgoing_buffer.clear();
        self.outbox.clear();
        self.codec = None;
        self.tone_payload = None;
        self.outgoing_tone = None;
    }
}
