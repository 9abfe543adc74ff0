//! The Serial-Over-LAN sub-protocol: sequence/ack/NACK framing layered on
//! top of RMCP+ payload type `0x01`, running atop an already-established
//! [`crate::session::Session`].

use std::io::Write;

/// Where inbound SOL bytes are delivered.
///
/// Mirrors the dynamically-dispatched `iohandler` argument of the system
/// this crate's SOL console is modeled on: a plain callback, a single
/// read+write handle, or a split input/output pair. Only the write side is
/// this module's concern — the read side (for `Duplex`/`Split`) is the
/// caller's responsibility to poll and feed to [`SolChannel::queue_output`]
/// (typically via `SessionManager::register_handle_callback`).
pub enum SolSink {
    /// A plain callback invoked with each chunk of inbound bytes.
    Callback(Box<dyn FnMut(&[u8]) + Send>),
    /// A single handle used for both reading (by the caller) and writing
    /// (inbound bytes, by this module).
    Duplex(Box<dyn Write + Send>),
    /// Only the write half of a split input/output pair.
    Split { output: Box<dyn Write + Send> },
}

impl SolSink {
    fn deliver(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self {
            SolSink::Callback(cb) => cb(data),
            SolSink::Duplex(w) | SolSink::Split { output: w } => {
                if let Err(e) = w.write_all(data) {
                    log::warn!("SOL: failed to write inbound data to sink: {e}");
                }
            }
        }
    }
}

/// The 4-byte header that precedes raw user data in every outbound SOL
/// packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboundHeader {
    pub my_seq: u8,
    pub acked_seq: u8,
    pub acked_count: u8,
    pub break_flag: u8,
}

/// Build one outbound SOL payload (header + raw bytes). The caller wraps
/// this in an RMCP+ frame with payload type `Sol`.
pub fn build_packet(header: OutboundHeader, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.push(header.my_seq);
    out.push(header.acked_seq);
    out.push(header.acked_count);
    out.push(header.break_flag);
    out.extend_from_slice(data);
    out
}

/// Fields parsed out of an inbound SOL payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub new_seq: u8,
    pub ack_seq: u8,
    pub ack_count: u8,
    pub nack: bool,
    pub powered_off: bool,
    pub deactivated: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooShort;

pub fn parse_packet(raw: &[u8]) -> Result<InboundPacket, TooShort> {
    if raw.len() < 4 {
        return Err(TooShort);
    }
    let flags = raw[3];
    Ok(InboundPacket {
        new_seq: raw[0] & 0x0F,
        ack_seq: raw[1] & 0x0F,
        ack_count: raw[2],
        nack: flags & 0x40 != 0,
        powered_off: flags & 0x20 != 0,
        deactivated: flags & 0x10 != 0,
        data: raw[4..].to_vec(),
    })
}

/// Per-session SOL state: outbound buffering/sequencing and inbound
/// retransmit de-duplication.
pub struct SolChannel {
    max_outbound_size: usize,
    my_seq: u8,
    remote_seq: u8,
    last_size: usize,
    awaiting_ack: bool,
    last_payload: Option<Vec<u8>>,
    pending_output: Vec<u8>,
    sink: SolSink,
}

impl SolChannel {
    pub fn new(max_outbound_size: usize, sink: SolSink) -> Self {
        Self {
            max_outbound_size: max_outbound_size.max(1),
            my_seq: 0,
            remote_seq: 0,
            last_size: 0,
            awaiting_ack: false,
            last_payload: None,
            pending_output: Vec::new(),
            sink,
        }
    }

    /// Buffer bytes the console wants to send. Does not itself send
    /// anything; call [`Self::try_send`] afterwards.
    pub fn queue_output(&mut self, data: &[u8]) {
        self.pending_output.extend_from_slice(data);
    }

    fn advance_my_seq(&mut self) {
        self.my_seq = (self.my_seq + 1) & 0x0F;
        if self.my_seq == 0 {
            self.my_seq = 1;
        }
    }

    /// If nothing is currently in flight and there is pending output, build
    /// and mark in-flight the next outbound packet. Returns the raw SOL
    /// payload to send.
    pub fn try_send(&mut self) -> Option<Vec<u8>> {
        if self.awaiting_ack || self.pending_output.is_empty() {
            return None;
        }

        self.advance_my_seq();
        let take = self.pending_output.len().min(self.max_outbound_size);
        let chunk: Vec<u8> = self.pending_output.drain(..take).collect();

        let header = OutboundHeader {
            my_seq: self.my_seq,
            acked_seq: 0,
            acked_count: 0,
            break_flag: 0,
        };
        let packet = build_packet(header, &chunk);
        self.last_payload = Some(packet.clone());
        self.awaiting_ack = true;
        Some(packet)
    }

    fn build_ack(&self, acked_count: usize) -> Vec<u8> {
        build_packet(
            OutboundHeader {
                my_seq: 0,
                acked_seq: self.remote_seq,
                acked_count: acked_count as u8,
                break_flag: 0,
            },
            &[],
        )
    }

    /// Process one inbound SOL payload, delivering any new bytes to the
    /// sink. Returns any packets that should be sent immediately as a side
    /// effect (an ack for inbound data, and/or a retransmit of our last
    /// send).
    pub fn handle_inbound(&mut self, raw: &[u8]) -> Result<Vec<Vec<u8>>, TooShort> {
        let packet = parse_packet(raw)?;
        let mut to_send = Vec::new();

        if packet.new_seq != 0 {
            let fresh: &[u8] = if packet.new_seq == self.remote_seq {
                // Retransmit, possibly carrying more data than we've already
                // delivered.
                if packet.data.len() > self.last_size {
                    &packet.data[self.last_size..]
                } else {
                    &[]
                }
            } else {
                // The remote sequence number is updated unconditionally,
                // even if it skips ahead of the expected next value — see
                // the design notes' Open Questions.
                self.remote_seq = packet.new_seq;
                &packet.data[..]
            };
            self.last_size = packet.data.len();
            self.sink.deliver(fresh);
            to_send.push(self.build_ack(packet.data.len()));
        }

        if self.my_seq != 0 && packet.ack_seq == self.my_seq {
            self.awaiting_ack = false;
            if packet.nack {
                if packet.powered_off {
                    log::warn!("SOL: remote system is powered down");
                } else if packet.deactivated {
                    log::warn!("SOL: remote console disconnected the payload");
                } else if let Some(last) = self.last_payload.take() {
                    let unacked_start = (4 + packet.ack_count as usize).min(last.len());
                    let mut requeued = last[unacked_start..].to_vec();
                    requeued.extend_from_slice(&self.pending_output);
                    self.pending_output = requeued;
                    if let Some(resend) = self.try_send() {
                        to_send.push(resend);
                    }
                }
            }
        } else if self.awaiting_ack {
            // The ack did not match what we were waiting for; resend
            // unconditionally. This occasionally fires an extra retry
            // sooner than the timer would, which is harmless.
            if let Some(last) = self.last_payload.clone() {
                to_send.push(last);
            }
        }

        Ok(to_send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_sink() -> (SolSink, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let buf2 = buf.clone();
        (
            SolSink::Callback(Box::new(move |data| buf2.lock().unwrap().extend_from_slice(data))),
            buf,
        )
    }

    #[test]
    fn retransmit_with_extra_bytes_delivers_only_the_suffix() {
        let (sink, buf) = collecting_sink();
        let mut sol = SolChannel::new(128, sink);

        sol.handle_inbound(&build_packet(
            OutboundHeader {
                my_seq: 1,
                acked_seq: 0,
                acked_count: 0,
                break_flag: 0,
            },
            b"abc",
        ))
        .unwrap();
        assert_eq!(&*buf.lock().unwrap(), b"abc");

        // Retransmit of the same new_seq, now with 2 extra bytes.
        sol.handle_inbound(&build_packet(
            OutboundHeader {
                my_seq: 1,
                acked_seq: 0,
                acked_count: 0,
                break_flag: 0,
            },
            b"abcde",
        ))
        .unwrap();
        assert_eq!(&*buf.lock().unwrap(), b"abcde");
    }

    #[test]
    fn nack_requeues_unacked_tail() {
        let (sink, _buf) = collecting_sink();
        let mut sol = SolChannel::new(128, sink);
        sol.queue_output(b"hello");
        let sent = sol.try_send().unwrap();
        assert_eq!(sol.my_seq, 1);

        let nack = build_packet(
            OutboundHeader {
                my_seq: 0,
                acked_seq: 1,
                acked_count: 2,
                break_flag: 0b0100_0000,
            },
            &[],
        );
        let to_send = sol.handle_inbound(&nack).unwrap();
        assert!(!sol.awaiting_ack || !to_send.is_empty());
        // 2 bytes were acked, the remaining 3 ("llo") should be resent.
        let resent = to_send.last().unwrap();
        assert_eq!(&resent[4..], b"llo");
        let _ = sent;
    }

    #[test]
    fn my_seq_wraps_from_fifteen_to_one() {
        let (sink, _buf) = collecting_sink();
        let mut sol = SolChannel::new(1, sink);
        sol.my_seq = 15;
        sol.queue_output(b"x");
        sol.try_send();
        assert_eq!(sol.my_seq, 1);
    }
}
