//! Per-transfer trackers for the two transfer directions.
//!
//! A status is created when the first block of a transfer is observed (or
//! when an outbound body turns out to need fragmenting), mutated only under
//! its lock, and destroyed exactly once: on completion, on an error reply,
//! or when the cleanup deadline passes. Observer callbacks fire on that
//! single destruction.

use alloc::vec::Vec;
use std::time::{Duration, Instant};

use crate::error::{HandlingError, SendError};
use crate::packet::Packet;

use super::value::{BlockValue, BERT_SUB_BLOCK_SIZE, BERT_SZX};

/// How a transfer ended, as reported to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEnd {
    /// The body was transferred completely.
    Completed,
    /// A newer transfer for the same key (or an LRU eviction) preempted
    /// this one.
    Cancelled,
    /// The cleanup deadline passed without progress.
    TimedOut,
    /// The lower layer refused a block of this transfer.
    SendFailed(SendError),
}

/// Callback invoked exactly once when a transfer is destroyed.
pub type TransferObserver = Box<dyn FnOnce(&TransferEnd) + Send>;

fn stride_of(szx: u8) -> usize {
    if szx == BERT_SZX {
        BERT_SUB_BLOCK_SIZE
    } else {
        1 << (szx + 4)
    }
}

/// Tracker for a request body: the assembly buffer of an inbound upload, or
/// the source body of an outbound one.
pub struct Block1Status {
    body: Vec<u8>,
    pub current_num: u32,
    pub szx: u8,
    pub content_format: Option<u16>,
    buffer_size: usize,
    pub complete: bool,
    deadline: Instant,
    observers: Vec<TransferObserver>,
    /// Early Block2 negotiation seen on the first upload block, replayed
    /// onto the assembled request.
    pub early_block2: Option<BlockValue>,
}

impl Block1Status {
    /// Starts assembling an inbound upload.
    pub fn new_inbound(
        szx: u8,
        content_format: Option<u16>,
        buffer_size: usize,
        lifetime: Duration,
    ) -> Self {
        Self {
            body: Vec::new(),
            current_num: 0,
            szx,
            content_format,
            buffer_size,
            complete: false,
            deadline: Instant::now() + lifetime,
            observers: Vec::new(),
            early_block2: None,
        }
    }

    /// Starts fragmenting an outbound upload of `body`.
    pub fn new_outbound(body: Vec<u8>, szx: u8, lifetime: Duration) -> Self {
        Self {
            buffer_size: body.len(),
            body,
            current_num: 0,
            szx,
            content_format: None,
            complete: false,
            deadline: Instant::now() + lifetime,
            observers: Vec::new(),
            early_block2: None,
        }
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Takes the assembled body, leaving the status complete and empty.
    pub fn take_body(&mut self) -> Vec<u8> {
        self.complete = true;
        core::mem::take(&mut self.body)
    }

    /// Appends an upload fragment, advancing `current_num` by the number of
    /// strides it covers (at least one, partial trailing strides included).
    pub fn append(&mut self, payload: &[u8]) -> Result<(), HandlingError> {
        if self.body.len() + payload.len() > self.buffer_size {
            return Err(HandlingError::body_too_large());
        }
        self.body.extend_from_slice(payload);
        let stride = stride_of(self.szx);
        self.current_num += ((payload.len() + stride - 1) / stride).max(1) as u32;
        Ok(())
    }

    /// Drops partial state so the transfer can restart from block zero.
    pub fn restart(&mut self, content_format: Option<u16>) {
        self.body.clear();
        self.current_num = 0;
        self.content_format = content_format;
        self.complete = false;
        self.early_block2 = None;
    }

    /// Cuts the next outgoing fragment: up to `bulk` strides starting at
    /// `num`, without advancing the cursor.
    pub fn fragment_at(&self, num: u32, bulk: usize) -> (Vec<u8>, BlockValue) {
        let stride = stride_of(self.szx);
        let start = (num as usize * stride).min(self.body.len());
        let end = (start + bulk.max(1) * stride).min(self.body.len());
        let more = end < self.body.len();
        (
            self.body[start..end].to_vec(),
            BlockValue {
                num,
                more,
                szx: self.szx,
            },
        )
    }

    /// Cuts the next outgoing fragment at the cursor and advances it.
    pub fn next_fragment(&mut self, bulk: usize) -> (Vec<u8>, BlockValue) {
        let (payload, block) = self.fragment_at(self.current_num, bulk);
        let stride = stride_of(self.szx);
        self.current_num += ((payload.len() + stride - 1) / stride).max(1) as u32;
        if !block.more {
            self.complete = true;
        }
        (payload, block)
    }

    pub fn add_observer(&mut self, observer: TransferObserver) {
        self.observers.push(observer);
    }

    /// Fires the observers; draining makes a second destruction a no-op.
    pub fn finish(&mut self, end: &TransferEnd) {
        self.complete = true;
        for observer in self.observers.drain(..) {
            observer(end);
        }
    }

    pub fn prepare_cleanup(&mut self, lifetime: Duration) {
        self.deadline = Instant::now() + lifetime;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// Tracker for a response body: the assembly buffer of an inbound download,
/// or the cached full response an outbound transfer is cropped from.
pub struct Block2Status {
    body: Vec<u8>,
    /// Complete response this transfer serves, template options included.
    pub response: Option<Packet>,
    pub current_num: u32,
    pub szx: u8,
    pub content_format: Option<u16>,
    buffer_size: usize,
    pub complete: bool,
    deadline: Instant,
    observers: Vec<TransferObserver>,
    /// Representation snapshot; a change mid-transfer restarts the
    /// download.
    pub etag: Option<Vec<u8>>,
    /// Whether this transfer carries an observe notification, so a newer
    /// notification may preempt it.
    pub notification: bool,
    /// Random-access statuses pass single responses through unassembled.
    pub random_access: bool,
}

impl Block2Status {
    /// Starts assembling an inbound download.
    pub fn new_inbound(
        szx: u8,
        buffer_size: usize,
        lifetime: Duration,
    ) -> Self {
        Self {
            body: Vec::new(),
            response: None,
            current_num: 0,
            szx,
            content_format: None,
            buffer_size,
            complete: false,
            deadline: Instant::now() + lifetime,
            observers: Vec::new(),
            etag: None,
            notification: false,
            random_access: false,
        }
    }

    /// Caches a complete outbound response to serve chunk requests from.
    pub fn new_outbound(response: Packet, szx: u8, lifetime: Duration) -> Self {
        Self {
            body: Vec::new(),
            content_format: response.get_content_format(),
            response: Some(response),
            current_num: 0,
            szx,
            buffer_size: 0,
            complete: false,
            deadline: Instant::now() + lifetime,
            observers: Vec::new(),
            etag: None,
            notification: false,
            random_access: false,
        }
    }

    /// Creates a pass-through status for an explicit block-N request.
    pub fn new_random_access(szx: u8, lifetime: Duration) -> Self {
        let mut status = Self::new_inbound(szx, 0, lifetime);
        status.random_access = true;
        status
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Takes the assembled body, leaving the status complete and empty.
    pub fn take_body(&mut self) -> Vec<u8> {
        self.complete = true;
        core::mem::take(&mut self.body)
    }

    /// Appends a download fragment, advancing `current_num` by the number
    /// of strides it covers.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), HandlingError> {
        if self.body.len() + payload.len() > self.buffer_size {
            return Err(HandlingError::body_too_large());
        }
        self.body.extend_from_slice(payload);
        let stride = stride_of(self.szx);
        self.current_num += ((payload.len() + stride - 1) / stride).max(1) as u32;
        Ok(())
    }

    /// Drops partial state after a representation change, keeping the new
    /// snapshot.
    pub fn restart(&mut self, etag: Option<Vec<u8>>, format: Option<u16>) {
        self.body.clear();
        self.current_num = 0;
        self.complete = false;
        self.etag = etag;
        self.content_format = format;
    }

    /// Crops the chunk a peer asked for out of the cached response body:
    /// up to `bulk` strides for BERT requests, exactly one block otherwise.
    ///
    /// The returned block echoes the requested NUM and SZX; `more` tells
    /// whether body remains past the chunk. Completion is recorded so the
    /// caller can clear the status.
    pub fn crop_response_chunk(
        &mut self,
        requested: &BlockValue,
        bulk: usize,
    ) -> Result<(Vec<u8>, BlockValue), HandlingError> {
        let body = match &self.response {
            Some(response) => &response.payload,
            None => return Err(HandlingError::unknown_block(requested.num)),
        };
        let stride = requested.stride();
        let start = requested.offset();
        if start >= body.len() {
            return Err(HandlingError::unknown_block(requested.num));
        }
        let count = if requested.is_bert() { bulk.max(1) } else { 1 };
        let end = (start + count * stride).min(body.len());
        let more = end < body.len();

        self.current_num =
            requested.num + ((end - start + stride - 1) / stride) as u32;
        self.complete = !more;

        Ok((
            body[start..end].to_vec(),
            BlockValue {
                num: requested.num,
                more,
                szx: requested.szx,
            },
        ))
    }

    pub fn add_observer(&mut self, observer: TransferObserver) {
        self.observers.push(observer);
    }

    /// Fires the observers; draining makes a second destruction a no-op.
    pub fn finish(&mut self, end: &TransferEnd) {
        self.complete = true;
        for observer in self.observers.drain(..) {
            observer(end);
        }
    }

    pub fn prepare_cleanup(&mut self, lifetime: Duration) {
        self.deadline = Instant::now() + lifetime;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const LIFETIME: Duration = Duration::from_secs(30);

    #[test]
    fn inbound_append_tracks_bert_strides() {
        let mut status =
            Block1Status::new_inbound(BERT_SZX, None, 8192, LIFETIME);
        status.append(&[0u8; 4096]).unwrap();
        assert_eq!(4, status.current_num);
        status.append(&[0u8; 500]).unwrap();
        assert_eq!(5, status.current_num);
        assert_eq!(4596, status.body_len());
    }

    #[test]
    fn inbound_append_rejects_overflow() {
        let mut status = Block1Status::new_inbound(6, None, 2048, LIFETIME);
        status.append(&[0u8; 1024]).unwrap();
        status.append(&[0u8; 1024]).unwrap();
        let err = status.append(&[1u8; 1]).unwrap_err();
        assert_eq!(
            Some(crate::ResponseType::RequestEntityTooLarge),
            err.code
        );
    }

    #[test]
    fn outbound_fragments_in_bulk() {
        let body: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut status =
            Block1Status::new_outbound(body.clone(), BERT_SZX, LIFETIME);

        let (first, block) = status.next_fragment(4);
        assert_eq!(4096, first.len());
        assert_eq!((0, true), (block.num, block.more));

        let (second, block) = status.next_fragment(4);
        assert_eq!(4096, second.len());
        assert_eq!((4, true), (block.num, block.more));

        let (third, block) = status.next_fragment(4);
        assert_eq!(1808, third.len());
        assert_eq!((8, false), (block.num, block.more));
        assert!(status.complete);

        let reassembled: Vec<u8> =
            [first, second, third].concat();
        assert_eq!(body, reassembled);
    }

    #[test]
    fn outbound_single_block_szx6() {
        let mut status =
            Block1Status::new_outbound(vec![7u8; 2500], 6, LIFETIME);
        let (payload, block) = status.next_fragment(1);
        assert_eq!(1024, payload.len());
        assert_eq!((0, true, 6), (block.num, block.more, block.szx));
    }

    #[test]
    fn observers_fire_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut status = Block1Status::new_inbound(6, None, 1024, LIFETIME);
        let counter = Arc::clone(&fired);
        status.add_observer(Box::new(move |end| {
            assert_eq!(&TransferEnd::Cancelled, end);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        status.finish(&TransferEnd::Cancelled);
        status.finish(&TransferEnd::Cancelled);
        assert_eq!(1, fired.load(Ordering::SeqCst));
    }

    #[test]
    fn crop_serves_random_access() {
        let mut response = Packet::new();
        response.payload = (0..5000u32).map(|i| i as u8).collect();
        let mut status = Block2Status::new_outbound(response, 6, LIFETIME);

        let requested = BlockValue::new(3, false, 6).unwrap();
        let (chunk, block) =
            status.crop_response_chunk(&requested, 1).unwrap();
        assert_eq!(1024, chunk.len());
        assert_eq!(
            (0..5000u32).map(|i| i as u8).collect::<Vec<_>>()[3072..4096],
            chunk[..]
        );
        assert_eq!((3, true, 6), (block.num, block.more, block.szx));
        assert!(!status.complete);
    }

    #[test]
    fn crop_bert_bulks_sub_blocks() {
        let mut response = Packet::new();
        response.payload = vec![9u8; 5000];
        let mut status =
            Block2Status::new_outbound(response, BERT_SZX, LIFETIME);

        let requested = BlockValue::bert(0, false).unwrap();
        let (chunk, block) =
            status.crop_response_chunk(&requested, 4).unwrap();
        assert_eq!(4096, chunk.len());
        assert!(block.more);
        assert_eq!(4, status.current_num);

        let requested = BlockValue::bert(4, false).unwrap();
        let (chunk, block) =
            status.crop_response_chunk(&requested, 4).unwrap();
        assert_eq!(904, chunk.len());
        assert!(!block.more);
        assert!(status.complete);
    }

    #[test]
    fn crop_past_body_is_unknown_block() {
        let mut response = Packet::new();
        response.payload = vec![0u8; 100];
        let mut status = Block2Status::new_outbound(response, 6, LIFETIME);
        let requested = BlockValue::new(5, false, 6).unwrap();
        let err = status.crop_response_chunk(&requested, 1).unwrap_err();
        assert_eq!(Some(crate::ResponseType::BadOption), err.code);
    }

    #[test]
    fn expiry_follows_deadline() {
        let mut status = Block1Status::new_inbound(6, None, 1024, LIFETIME);
        assert!(!status.expired(Instant::now()));
        status.prepare_cleanup(Duration::ZERO);
        assert!(status.expired(Instant::now()));
    }
}
