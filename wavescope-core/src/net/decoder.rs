//! The opaque streaming-decoder seam.
//!
//! The decoder's only contract is "raw PCM packets with declared caps and
//! an optional PTS". Everything vendor-specific lives on the other side of
//! [`StreamDecoder`]; the source composes a [`PipelineSpec`] describing the
//! element chain it wants and the decoder realizes it however it likes.
//! Test doubles script the trait directly.

use std::time::Duration;

use crate::error::Result;
use crate::format::SampleFormat;
use crate::net::NetworkInputConfig;

/// Declared capabilities of the decoded stream, read from the first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCaps {
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decoded PCM payload, interleaved by channel.
#[derive(Debug, Clone)]
pub enum PacketPayload {
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
}

impl PacketPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            PacketPayload::Int16(v) => v.is_empty(),
            PacketPayload::Int32(v) => v.is_empty(),
            PacketPayload::Float32(v) => v.is_empty(),
        }
    }
}

/// One decoded packet.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub caps: StreamCaps,
    pub payload: PacketPayload,
    /// Presentation timestamp in nanoseconds, when the stream carries one.
    pub pts_ns: Option<u64>,
}

/// Outcome of a bounded wait for the next packet.
#[derive(Debug)]
pub enum PacketStatus {
    Packet(DecodedPacket),
    /// Nothing arrived within the poll window.
    Idle,
    /// The stream ended naturally.
    Eos,
}

/// External streaming decoder. One instance per connection attempt; the
/// source never reuses a stopped decoder.
pub trait StreamDecoder: Send {
    /// Realize the pipeline and start producing packets.
    fn start(&mut self, spec: &PipelineSpec) -> Result<()>;

    /// Block up to `timeout` for the next decoded packet.
    fn poll_packet(&mut self, timeout: Duration) -> Result<PacketStatus>;

    /// Tear the pipeline down. Idempotent.
    fn stop(&mut self);
}

/// Creates a fresh decoder per connection attempt (reconnects rebuild the
/// whole pipeline rather than reviving a failed one).
pub trait DecoderFactory: Send {
    fn create(&mut self) -> Box<dyn StreamDecoder>;
}

impl<F> DecoderFactory for F
where
    F: FnMut() -> Box<dyn StreamDecoder> + Send,
{
    fn create(&mut self) -> Box<dyn StreamDecoder> {
        (self)()
    }
}

// ---------------------------------------------------------------------------
// Pipeline composition
// ---------------------------------------------------------------------------

/// Scheme-specific source element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceElement {
    Http {
        url: String,
        user_agent: String,
        timeout_ms: u64,
        extra_headers: Vec<(String, String)>,
        allow_insecure_tls: bool,
    },
    File {
        location: String,
    },
    Udp {
        uri: String,
    },
}

/// Caps pin applied after conversion, present when any target is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsFilter {
    pub format: Option<SampleFormat>,
    pub rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Sample sink tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSettings {
    pub max_buffers: u32,
    pub drop: bool,
    pub sync: bool,
    pub asynchronous: bool,
}

/// Element chain the source asks the decoder to realize:
/// source → decode → convert → [resample] → [caps filter] → sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub source: SourceElement,
    pub resample_to: Option<u32>,
    pub caps_filter: Option<CapsFilter>,
    pub sink: SinkSettings,
}

impl PipelineSpec {
    /// Compose the chain from a validated configuration.
    pub fn from_config(config: &NetworkInputConfig) -> Result<Self> {
        config.validate()?;
        let scheme = config.scheme().expect("validated above");

        let source = match scheme.as_str() {
            "http" | "https" => SourceElement::Http {
                url: config.url.clone(),
                user_agent: config.user_agent.clone(),
                timeout_ms: config.connection_timeout_ms,
                extra_headers: config.extra_headers.clone(),
                allow_insecure_tls: config.allow_insecure_tls,
            },
            "file" => SourceElement::File {
                location: config.url.trim_start_matches("file://").to_string(),
            },
            // udp / rtp / rtsp all take the full URI.
            _ => SourceElement::Udp {
                uri: config.url.clone(),
            },
        };

        let caps_filter = {
            let format = (config.target_format != SampleFormat::Unknown).then_some(config.target_format);
            let rate = (config.target_sample_rate != 0).then_some(config.target_sample_rate);
            let channels = (config.target_channels != 0).then_some(config.target_channels);
            (format.is_some() || rate.is_some() || channels.is_some()).then_some(CapsFilter {
                format,
                rate,
                channels,
            })
        };

        Ok(Self {
            source,
            resample_to: (config.target_sample_rate != 0).then_some(config.target_sample_rate),
            caps_filter,
            sink: SinkSettings {
                max_buffers: config.max_buffers,
                drop: config.drop_buffers,
                sync: config.sync_audio,
                asynchronous: config.async_sink,
            },
        })
    }

    /// Human-readable launch description, for logs and decoder backends
    /// that take a textual pipeline.
    pub fn launch_description(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        match &self.source {
            SourceElement::Http {
                url,
                user_agent,
                timeout_ms,
                extra_headers,
                allow_insecure_tls,
            } => {
                let mut s = format!(
                    "httpsrc location={url} user-agent=\"{user_agent}\" timeout-ms={timeout_ms}"
                );
                for (k, v) in extra_headers {
                    s.push_str(&format!(" header=\"{k}: {v}\""));
                }
                if *allow_insecure_tls {
                    s.push_str(" ssl-strict=false");
                }
                parts.push(s);
            }
            SourceElement::File { location } => parts.push(format!("filesrc location={location}")),
            SourceElement::Udp { uri } => parts.push(format!("udpsrc uri={uri}")),
        }
        parts.push("decode".into());
        parts.push("audioconvert".into());
        if self.resample_to.is_some() {
            parts.push("audioresample".into());
        }
        if let Some(caps) = &self.caps_filter {
            let mut s = String::from("capsfilter audio/x-raw");
            if let Some(format) = caps.format {
                s.push_str(&format!(",format={format:?}"));
            }
            if let Some(rate) = caps.rate {
                s.push_str(&format!(",rate={rate}"));
            }
            if let Some(channels) = caps.channels {
                s.push_str(&format!(",channels={channels}"));
            }
            parts.push(s);
        }
        parts.push(format!(
            "appsink max-buffers={} drop={} sync={} async={}",
            self.sink.max_buffers, self.sink.drop, self.sink.sync, self.sink.asynchronous
        ));
        parts.join(" ! ")
    }
}
