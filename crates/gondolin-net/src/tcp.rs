//! The TCP state machine. One [`TcpConnection`] exists per flow and is
//! driven exclusively by the connection's own task — no other task ever
//! touches its state, so no internal locking is needed.

use gondolin_common::flow::TcpState;
use rand::RngCore;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

pub const TIME_WAIT_DURATION: Duration = Duration::from_secs(60);
const INITIAL_RTO: Duration = Duration::from_millis(500);
const MAX_RTO: Duration = Duration::from_secs(60);
const MAX_RETRANSMITS: u32 = 12;

/// TCP control-bit constants (the six low flag bits of the 13th header byte).
pub struct TcpFlags;

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < 20 || data_offset > data.len() {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes(data[4..8].try_into().ok()?),
            ack: u32::from_be_bytes(data[8..12].try_into().ok()?),
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            payload: &data[data_offset..],
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Builds a bare TCP segment (no options); checksum is left zero, callers
/// fold the pseudo-header checksum in at the IPv4 layer.
pub fn build_segment(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, window: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + payload.len());
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ack.to_be_bytes());
    out.push(5 << 4); // data offset, no options
    out.push(flags);
    out.extend_from_slice(&window.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
    out.extend_from_slice(payload);
    out
}

struct RetransmitEntry {
    seq: u32,
    data: Vec<u8>,
    flags: u8,
    sent_at: Instant,
    attempts: u32,
}

/// A single TCP connection's state, sequence-number bookkeeping and
/// retransmission queue. Sequence numbers wrap with standard `u32`
/// arithmetic; callers compare with `wrapping_sub`, never raw `<`.
pub struct TcpConnection {
    pub state: TcpState,
    pub iss: u32,
    pub irs: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    retransmit_queue: VecDeque<RetransmitEntry>,
    time_wait_entered: Option<Instant>,
    zero_window_since: Option<Instant>,
    /// Segments that arrived ahead of `rcv_nxt`, keyed by their starting
    /// sequence number, waiting for the gap before them to close.
    reassembly: BTreeMap<u32, Vec<u8>>,
}

/// Draws a cryptographically random initial sequence number. Using the OS
/// RNG (rather than the classic clock-derived ISN) removes sequence-number
/// guessing as an attack against the synthetic guest-facing stack.
pub fn allocate_isn() -> u32 {
    rand::rngs::OsRng.next_u32()
}

impl TcpConnection {
    pub fn new_listener() -> Self {
        Self {
            state: TcpState::Listen,
            iss: 0,
            irs: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            snd_wnd: 65535,
            rcv_wnd: 65535,
            retransmit_queue: VecDeque::new(),
            time_wait_entered: None,
            zero_window_since: None,
            reassembly: BTreeMap::new(),
        }
    }

    /// Handles an inbound SYN while in `Listen`, choosing our ISN and
    /// moving to `SynReceived`. Returns the SYN-ACK segment to send.
    pub fn on_syn(&mut self, peer_syn: &TcpSegment<'_>) -> Vec<u8> {
        self.irs = peer_syn.seq;
        self.iss = allocate_isn();
        self.snd_una = self.iss;
        self.snd_nxt = self.iss.wrapping_add(1);
        self.rcv_nxt = self.irs.wrapping_add(1);
        self.state = TcpState::SynReceived;
        self.snd_wnd = peer_syn.window;

        let seg = build_segment(0, 0, self.iss, self.rcv_nxt, TcpFlags::SYN | TcpFlags::ACK, self.rcv_wnd, &[]);
        self.enqueue_retransmit(self.iss, TcpFlags::SYN | TcpFlags::ACK, &[]);
        seg
    }

    /// The final ACK of the handshake; moves `SynReceived` to `Established`.
    pub fn on_handshake_ack(&mut self, seg: &TcpSegment<'_>) -> bool {
        if self.state != TcpState::SynReceived {
            return false;
        }
        if seg.ack != self.snd_nxt {
            return false;
        }
        self.snd_una = seg.ack;
        self.clear_acked(seg.ack);
        self.state = TcpState::Established;
        true
    }

    /// Accepts inbound data while the connection is in a data-capable
    /// state. In-order bytes are delivered (and `rcv_nxt` advanced)
    /// immediately; a segment that arrives ahead of `rcv_nxt` is queued
    /// rather than dropped, bounded by the advertised receive window, and
    /// coalesced into the returned bytes once the preceding gap closes.
    /// Returns `None` when nothing is ready for delivery yet.
    pub fn on_data(&mut self, seg: &TcpSegment<'_>) -> Option<Vec<u8>> {
        if !self.state.is_data_capable() || seg.payload.is_empty() {
            return None;
        }

        if seg.has(TcpFlags::ACK) {
            self.snd_una = seg.ack;
            self.clear_acked(seg.ack);
        }

        let diff = seg.seq.wrapping_sub(self.rcv_nxt) as i32;
        if diff > 0 {
            if (diff as u32) < self.rcv_wnd as u32 {
                self.reassembly.insert(seg.seq, seg.payload.to_vec());
            }
            return None;
        }

        let payload = if diff < 0 {
            let already_seen = (-diff) as usize;
            if already_seen >= seg.payload.len() {
                return None; // pure retransmit of data already delivered
            }
            &seg.payload[already_seen..]
        } else {
            seg.payload
        };

        self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
        let mut out = payload.to_vec();
        while let Some(queued) = self.reassembly.remove(&self.rcv_nxt) {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(queued.len() as u32);
            out.extend(queued);
        }
        Some(out)
    }

    /// Queues an outbound data segment and advances `snd_nxt`.
    pub fn send_data(&mut self, payload: &[u8]) -> Vec<u8> {
        let seq = self.snd_nxt;
        let seg = build_segment(0, 0, seq, self.rcv_nxt, TcpFlags::ACK | TcpFlags::PSH, self.rcv_wnd, payload);
        self.enqueue_retransmit(seq, TcpFlags::ACK | TcpFlags::PSH, payload);
        self.snd_nxt = self.snd_nxt.wrapping_add(payload.len() as u32);
        seg
    }

    /// Initiates a host-side active close: `Established` -> `FinWait1`.
    pub fn initiate_close(&mut self) -> Vec<u8> {
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.state = TcpState::FinWait1;
        let seg = build_segment(0, 0, seq, self.rcv_nxt, TcpFlags::FIN | TcpFlags::ACK, self.rcv_wnd, &[]);
        self.enqueue_retransmit(seq, TcpFlags::FIN | TcpFlags::ACK, &[]);
        seg
    }

    /// Processes an inbound segment carrying FIN, driving the passive-close
    /// and simultaneous-close legs of the state machine.
    pub fn on_fin(&mut self, seg: &TcpSegment<'_>) -> Vec<u8> {
        self.rcv_nxt = seg.seq.wrapping_add(seg.payload.len() as u32).wrapping_add(1);
        let ack = build_segment(0, 0, self.snd_nxt, self.rcv_nxt, TcpFlags::ACK, self.rcv_wnd, &[]);

        self.state = match self.state {
            TcpState::Established => TcpState::CloseWait,
            TcpState::FinWait1 if seg.has(TcpFlags::ACK) && seg.ack == self.snd_nxt => {
                self.enter_time_wait();
                TcpState::TimeWait
            }
            TcpState::FinWait1 => TcpState::FinWait2, // simultaneous close not yet acked
            TcpState::FinWait2 => {
                self.enter_time_wait();
                TcpState::TimeWait
            }
            other => other,
        };
        ack
    }

    /// The host-side ACK of the peer's FIN in `FinWait1`/`FinWait2` arrives
    /// out of band from `on_fin` when the peer ACKs our own FIN first.
    pub fn on_fin_acked(&mut self, seg: &TcpSegment<'_>) {
        if seg.ack != self.snd_nxt {
            return;
        }
        match self.state {
            TcpState::FinWait1 => self.state = TcpState::FinWait2,
            TcpState::LastAck => self.state = TcpState::Closed,
            _ => {}
        }
    }

    /// `CloseWait` -> `LastAck`, sending our own FIN after the application
    /// has finished writing.
    pub fn close_from_close_wait(&mut self) -> Vec<u8> {
        let seq = self.snd_nxt;
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.state = TcpState::LastAck;
        let seg = build_segment(0, 0, seq, self.rcv_nxt, TcpFlags::FIN | TcpFlags::ACK, self.rcv_wnd, &[]);
        self.enqueue_retransmit(seq, TcpFlags::FIN | TcpFlags::ACK, &[]);
        seg
    }

    fn enter_time_wait(&mut self) {
        self.time_wait_entered = Some(Instant::now());
    }

    /// Whether a connection parked in `TimeWait` has served its minimum
    /// 2*MSL-equivalent quiescent period and may be reaped.
    pub fn time_wait_expired(&self) -> bool {
        match self.time_wait_entered {
            Some(entered) => entered.elapsed() >= TIME_WAIT_DURATION,
            None => false,
        }
    }

    fn enqueue_retransmit(&mut self, seq: u32, flags: u8, payload: &[u8]) {
        self.retransmit_queue.push_back(RetransmitEntry {
            seq,
            data: payload.to_vec(),
            flags,
            sent_at: Instant::now(),
            attempts: 0,
        });
    }

    fn clear_acked(&mut self, ack: u32) {
        self.retransmit_queue.retain(|entry| {
            let end = entry.seq.wrapping_add(entry.data.len() as u32).wrapping_add(
                if entry.flags & (TcpFlags::SYN | TcpFlags::FIN) != 0 { 1 } else { 0 },
            );
            // Keep entries whose end sequence is still ahead of `ack`
            // (exponential-backoff-aware wrapping comparison).
            end.wrapping_sub(ack) > 0 && end.wrapping_sub(ack) < 0x8000_0000
        });
    }

    /// Segments whose retransmission timeout has elapsed, with exponential
    /// backoff applied per attempt. Returns `None` entries once
    /// `MAX_RETRANSMITS` is exceeded, signalling the caller should reset
    /// the connection instead.
    pub fn due_retransmits(&mut self) -> Result<Vec<Vec<u8>>, ()> {
        let mut out = Vec::new();
        for entry in self.retransmit_queue.iter_mut() {
            let rto = (INITIAL_RTO * 2u32.saturating_pow(entry.attempts)).min(MAX_RTO);
            if entry.sent_at.elapsed() >= rto {
                if entry.attempts >= MAX_RETRANSMITS {
                    return Err(());
                }
                entry.attempts += 1;
                entry.sent_at = Instant::now();
                out.push(build_segment(0, 0, entry.seq, self.rcv_nxt, entry.flags, self.rcv_wnd, &entry.data));
            }
        }
        Ok(out)
    }

    /// Records that the peer's receive window has collapsed to zero, for
    /// zero-window-probe scheduling.
    pub fn note_peer_window(&mut self, window: u16) {
        self.snd_wnd = window;
        if window == 0 {
            self.zero_window_since.get_or_insert(Instant::now());
        } else {
            self.zero_window_since = None;
        }
    }

    /// Whether a zero-window probe (one byte, just past `snd_una`) is due.
    pub fn zero_window_probe_due(&self, probe_interval: Duration) -> bool {
        matches!(self.zero_window_since, Some(since) if since.elapsed() >= probe_interval)
    }

    pub fn build_zero_window_probe(&self) -> Vec<u8> {
        build_segment(0, 0, self.snd_una, self.rcv_nxt, TcpFlags::ACK, self.rcv_wnd, &[0])
    }
}
