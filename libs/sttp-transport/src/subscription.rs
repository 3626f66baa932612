//! Subscription parameter exchange
//!
//! A `Subscribe` payload is `[1 byte data-packet flags][u32 length][parameter
//! string]`; parameters are `key=value` pairs separated by semicolons. Both
//! ends share this build/parse logic so the contract cannot drift.

use bytes::BufMut;

use sttp_core::dataset::FilterExpression;
use sttp_core::flags::data_packet_flags;
use sttp_core::wire::{decode_string, encode_string, StringEncoding, WireReader};
use sttp_core::Ticks;

use crate::error::{Result, TransportError};

/// Everything a subscriber requests at subscribe time
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub filter_expression: String,
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    pub compress_payload: bool,
    pub double_precision: bool,
    /// UDP port the subscriber listens on, when a data channel is requested
    pub udp_port: Option<u16>,
    /// Interface the data channel is bound to; the publisher targets it when
    /// it names a concrete address
    pub udp_interface: Option<String>,
    pub encrypt_data_channel: bool,
    /// Historical replay window start, when supported by the publisher
    pub start_time: Option<Ticks>,
    pub stop_time: Option<Ticks>,
    /// Down-sampling interval in milliseconds; -1 requests full resolution
    pub processing_interval: i32,
    /// Cap on unconfirmed buffer blocks in flight; 0 means unbounded
    pub buffer_block_limit: u32,
}

impl SubscriptionInfo {
    pub fn new(filter_expression: impl Into<String>) -> Self {
        Self {
            filter_expression: filter_expression.into(),
            include_time: true,
            use_millisecond_resolution: false,
            compress_payload: false,
            double_precision: false,
            udp_port: None,
            udp_interface: None,
            encrypt_data_channel: false,
            start_time: None,
            stop_time: None,
            processing_interval: -1,
            buffer_block_limit: 0,
        }
    }

    /// Validate the filter expression without resolving it
    pub fn parsed_filter(&self) -> Result<FilterExpression> {
        Ok(FilterExpression::parse(&self.filter_expression)?)
    }

    /// Requested data-packet flag bits
    pub fn packet_flags(&self) -> u8 {
        let mut flags = data_packet_flags::COMPACT;
        if self.compress_payload {
            flags |= data_packet_flags::COMPRESSED;
        }
        flags
    }

    /// Serialize into a `Subscribe` command payload
    pub fn encode(&self, encoding: StringEncoding) -> Vec<u8> {
        let mut params = format!(
            "filterExpression={{{}}}; includeTime={}; useMillisecondResolution={}; \
             compressPayload={}; doublePrecision={}; processingInterval={}; \
             bufferBlockLimit={}",
            self.filter_expression,
            self.include_time,
            self.use_millisecond_resolution,
            self.compress_payload,
            self.double_precision,
            self.processing_interval,
            self.buffer_block_limit,
        );
        if let Some(port) = self.udp_port {
            params.push_str(&format!("; udpPort={port}"));
            if let Some(interface) = &self.udp_interface {
                params.push_str(&format!("; udpInterface={interface}"));
            }
            params.push_str(&format!("; encryptData={}", self.encrypt_data_channel));
        }
        if let Some(start) = self.start_time {
            params.push_str(&format!("; startTime={}", start.0));
        }
        if let Some(stop) = self.stop_time {
            params.push_str(&format!("; stopTime={}", stop.0));
        }

        let raw = encode_string(&params, encoding);
        let mut out = Vec::with_capacity(raw.len() + 5);
        out.push(self.packet_flags());
        out.put_u32(raw.len() as u32);
        out.extend_from_slice(&raw);
        out
    }

    /// Parse a received `Subscribe` payload
    pub fn decode(payload: &[u8], encoding: StringEncoding) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let flags = reader.read_u8().map_err(TransportError::Codec)?;
        let length = reader.read_u32().map_err(TransportError::Codec)? as usize;
        let raw = reader.read_bytes(length).map_err(TransportError::Codec)?;
        let params = decode_string(raw, encoding).map_err(TransportError::Codec)?;

        let mut info = SubscriptionInfo::new("");
        info.compress_payload = flags & data_packet_flags::COMPRESSED != 0;

        for pair in split_params(&params) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(TransportError::SubscriptionRejected(format!(
                    "malformed parameter '{pair}'"
                )));
            };
            let key = key.trim();
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "filterexpression" => {
                    info.filter_expression = value
                        .strip_prefix('{')
                        .and_then(|v| v.strip_suffix('}'))
                        .unwrap_or(value)
                        .to_string();
                }
                "includetime" => info.include_time = parse_bool(key, value)?,
                "usemillisecondresolution" => {
                    info.use_millisecond_resolution = parse_bool(key, value)?
                }
                "compresspayload" => info.compress_payload = parse_bool(key, value)?,
                "doubleprecision" => info.double_precision = parse_bool(key, value)?,
                "udpport" => {
                    info.udp_port = Some(value.parse().map_err(|_| {
                        TransportError::SubscriptionRejected(format!("bad udpPort '{value}'"))
                    })?)
                }
                "udpinterface" => info.udp_interface = Some(value.to_string()),
                "encryptdata" => info.encrypt_data_channel = parse_bool(key, value)?,
                "starttime" => info.start_time = Some(Ticks(parse_u64(key, value)?)),
                "stoptime" => info.stop_time = Some(Ticks(parse_u64(key, value)?)),
                "processinginterval" => {
                    info.processing_interval = value.parse().map_err(|_| {
                        TransportError::SubscriptionRejected(format!(
                            "bad processingInterval '{value}'"
                        ))
                    })?
                }
                "bufferblocklimit" => {
                    info.buffer_block_limit = parse_u64(key, value)? as u32
                }
                // Unknown keys are ignored for forward compatibility
                _ => {}
            }
        }

        if info.filter_expression.is_empty() {
            return Err(TransportError::SubscriptionRejected(
                "missing filterExpression".to_string(),
            ));
        }
        Ok(info)
    }
}

/// Split on semicolons that are not inside a braced filter expression
fn split_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in params.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => {
                let piece = params[start..i].trim();
                if !piece.is_empty() {
                    out.push(piece);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let piece = params[start..].trim();
    if !piece.is_empty() {
        out.push(piece);
    }
    out
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(TransportError::SubscriptionRejected(format!(
            "bad boolean '{value}' for {key}"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        TransportError::SubscriptionRejected(format!("bad integer '{value}' for {key}"))
    })
}
