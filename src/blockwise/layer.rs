//! The blockwise state machine.
//!
//! One machine covers both plain RFC 7959 transfers (`SZX <= 6`) and BERT
//! (`SZX == 7`): the only policy differences are the stride NUM counts in
//! and how many sub-blocks may be bulked into a single message, so both are
//! parameters rather than a separate implementation.
//!
//! The layer performs no I/O of its own. Messages arrive through the four
//! direction entry points and leave synchronously through the [`LowerLayer`]
//! and [`UpperLayer`] contracts; the owning endpoint drives
//! [`BlockwiseLayer::purge_expired`] from its timer.

use core::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{HandlingError, SendError};
use crate::header::ResponseType;
use crate::packet::{CoapOption, Packet};
use crate::request::CoapRequest;
use crate::response::CoapResponse;

use super::key::TransferKey;
use super::registry::{lock, TransferRegistry};
use super::status::{
    Block1Status, Block2Status, TransferEnd, TransferObserver,
};
use super::value::{szx_for_size, BlockValue, BERT_SZX};

/// The configuration for [`BlockwiseLayer`].
#[derive(Debug, Clone)]
pub struct BlockwiseConfig {
    /// How many 1024-byte sub-blocks may travel in one message. Values
    /// above 1 enable BERT on outbound transfers.
    pub bulk_blocks: usize,

    /// Block size used when we initiate a plain transfer; one of 16, 32,
    /// 64, 128, 256, 512 or 1024.
    pub preferred_block_size: usize,

    /// Payloads above this threshold are fragmented.
    pub max_message_size: usize,

    /// Hard cap on any assembled body.
    pub max_resource_body_size: usize,

    /// How long an idle transfer may live before the cleanup pass removes
    /// it. Every mutation of a transfer rearms its deadline.
    pub status_lifetime: Duration,

    /// Upper bound on concurrently tracked transfers per direction;
    /// beyond it the transfer nearest its cleanup deadline is cancelled.
    pub max_active_transfers: usize,
}

impl Default for BlockwiseConfig {
    fn default() -> Self {
        Self {
            bulk_blocks: 1,
            preferred_block_size: 1024,
            max_message_size: 1152,
            max_resource_body_size: 8192,
            status_lifetime: Duration::from_secs(30),
            max_active_transfers: 64,
        }
    }
}

impl BlockwiseConfig {
    fn bert_enabled(&self) -> bool {
        self.bulk_blocks > 1
    }

    fn preferred_szx(&self) -> u8 {
        szx_for_size(self.preferred_block_size).unwrap_or(6)
    }
}

/// The layer above: application, observe handling, matcher.
pub trait UpperLayer<Endpoint>: Send + Sync {
    /// Invoked once per fully assembled request.
    fn receive_request(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: CoapRequest<Endpoint>,
    );

    /// Invoked once per fully assembled response.
    fn receive_response(
        &self,
        exchange: &mut Exchange<Endpoint>,
        response: CoapResponse,
    );
}

/// The layer below: message serialisation and the transport.
pub trait LowerLayer<Endpoint>: Send + Sync {
    fn send_request(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: CoapRequest<Endpoint>,
    ) -> Result<(), SendError>;

    fn send_response(
        &self,
        exchange: &mut Exchange<Endpoint>,
        response: CoapResponse,
    ) -> Result<(), SendError>;
}

/// Per-exchange context carried between the layers.
pub struct Exchange<Endpoint> {
    pub peer: Endpoint,

    /// The request this exchange is about. Inbound, the layer stores the
    /// (possibly reassembled) request here before delivering it upward;
    /// outbound, the request as handed down, so responses can be matched
    /// against what was asked.
    pub request: Option<CoapRequest<Endpoint>>,

    /// Final Block1 of an assembled upload, echoed on the eventual
    /// response.
    block1_to_ack: Option<BlockValue>,

    /// Observers handed to the next transfer this exchange starts.
    observers: Vec<TransferObserver>,
}

impl<Endpoint> Exchange<Endpoint> {
    pub fn new(peer: Endpoint) -> Self {
        Self {
            peer,
            request: None,
            block1_to_ack: None,
            observers: Vec::new(),
        }
    }

    /// Registers a callback fired exactly once when the transfer started by
    /// this exchange is destroyed.
    pub fn on_transfer_end(
        &mut self,
        observer: impl FnOnce(&TransferEnd) + Send + 'static,
    ) {
        self.observers.push(Box::new(observer));
    }
}

/// The Block1/Block2 transfer layer.
pub struct BlockwiseLayer<Endpoint: Ord + Clone> {
    config: BlockwiseConfig,
    registry: TransferRegistry<Endpoint>,
    upper: Arc<dyn UpperLayer<Endpoint>>,
    lower: Arc<dyn LowerLayer<Endpoint>>,
}

fn get_block(message: &Packet, tp: CoapOption) -> Option<BlockValue> {
    message
        .get_first_option_as::<BlockValue>(tp)
        .and_then(|block| block.ok())
}

fn set_block(message: &mut Packet, tp: CoapOption, block: &BlockValue) {
    message.set_option_as(tp, block.clone());
}

/// Copies code and template options from a cached response onto a follow-up
/// chunk response. MID, token and payload stay with the current request,
/// and the per-transfer options are re-derived per chunk.
fn clone_response_template(dst: &mut Packet, src: &Packet) {
    dst.header.version = src.header.version;
    dst.header.code = src.header.code;
    for (&number, values) in src.options() {
        match CoapOption::from(number) {
            CoapOption::Block1
            | CoapOption::Block2
            | CoapOption::Observe
            | CoapOption::Size2 => continue,
            option => dst.set_option(option, values.clone()),
        }
    }
}

impl<Endpoint: Ord + Clone> BlockwiseLayer<Endpoint> {
    pub fn new(
        config: BlockwiseConfig,
        upper: Arc<dyn UpperLayer<Endpoint>>,
        lower: Arc<dyn LowerLayer<Endpoint>>,
    ) -> Self {
        let registry =
            TransferRegistry::new(config.max_active_transfers);
        Self {
            config,
            registry,
            upper,
            lower,
        }
    }

    /// Removes every transfer whose cleanup deadline has passed, notifying
    /// its observers. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.registry.purge_expired()
    }

    /// The number of transfers currently tracked, across both directions.
    pub fn active_transfers(&self) -> usize {
        self.registry.block1.len() + self.registry.block2.len()
    }

    // ---- inbound request ------------------------------------------------

    /// Entry point for requests arriving from the transport.
    pub fn receive_request(
        &self,
        exchange: &mut Exchange<Endpoint>,
        mut request: CoapRequest<Endpoint>,
    ) {
        let key = TransferKey::of_request(&request);

        if let Some(block2) = get_block(&request.message, CoapOption::Block2)
        {
            if block2.num > 0 {
                if let Some(status) = self.registry.block2.get(&key) {
                    self.continue_response_transfer(
                        exchange, request, &key, &status, &block2,
                    );
                    return;
                }
                // No transfer state: let the application serve it and crop
                // the requested block out of its response.
            }
        }

        if let Some(block1) = get_block(&request.message, CoapOption::Block1)
        {
            match self.receive_upload_block(
                exchange,
                &mut request,
                &key,
                &block1,
            ) {
                Ok(Some(assembled)) => {
                    exchange.request = Some(assembled.clone());
                    self.upper.receive_request(exchange, assembled);
                }
                Ok(None) => {}
                Err(err) => {
                    if let Some(dropped) = self.registry.block1.remove(&key)
                    {
                        lock(&dropped).finish(&TransferEnd::Cancelled);
                    }
                    self.reject(exchange, &mut request, err);
                }
            }
            return;
        }

        exchange.request = Some(request.clone());
        self.upper.receive_request(exchange, request);
    }

    /// Handles one block of an inbound upload. Returns the assembled
    /// request once the final block arrived.
    fn receive_upload_block(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: &mut CoapRequest<Endpoint>,
        key: &TransferKey<Endpoint>,
        block1: &BlockValue,
    ) -> Result<Option<CoapRequest<Endpoint>>, HandlingError> {
        if let Some(size1) = request.message.get_size_hint(CoapOption::Size1)
        {
            if size1 as usize > self.config.max_resource_body_size {
                return Err(HandlingError::request_body_too_large(
                    self.config.max_resource_body_size,
                ));
            }
        }

        let status_arc = match self.registry.block1.get(key) {
            Some(status) => status,
            None => {
                if block1.num != 0 {
                    return Err(HandlingError::wrong_block_number());
                }
                let status = Arc::new(Mutex::new(Block1Status::new_inbound(
                    block1.szx,
                    request.message.get_content_format(),
                    self.config.max_resource_body_size,
                    self.config.status_lifetime,
                )));
                self.registry
                    .block1
                    .insert(key.clone(), Arc::clone(&status));
                status
            }
        };

        let mut status = lock(&status_arc);

        if block1.num == 0 && status.current_num > 0 {
            coap_debug!("upload restarted from block zero, dropping partial body");
            status.restart(request.message.get_content_format());
        }
        if block1.num != status.current_num {
            return Err(HandlingError::wrong_block_number());
        }
        if status.content_format != request.message.get_content_format() {
            return Err(HandlingError::content_format_mismatch());
        }
        if block1.num == 0 {
            status.early_block2 =
                get_block(&request.message, CoapOption::Block2);
        }

        status.append(&request.message.payload)?;
        status.prepare_cleanup(self.config.status_lifetime);

        if block1.more {
            drop(status);
            self.reply_continue(exchange, request, block1);
            return Ok(None);
        }

        let body = status.take_body();
        let early_block2 = status.early_block2.take();
        drop(status);
        if let Some(done) = self.registry.block1.remove(key) {
            lock(&done).finish(&TransferEnd::Completed);
        }

        // The last fragment contributes MID, token and options; only the
        // payload is replaced by the assembled body.
        let mut assembled = request.clone();
        assembled.message.payload = body;
        assembled.message.clear_option(CoapOption::Block1);
        assembled.message.clear_option(CoapOption::Size1);
        if assembled.message.get_option(CoapOption::Block2).is_none() {
            if let Some(block2) = early_block2 {
                set_block(&mut assembled.message, CoapOption::Block2, &block2);
            }
        }
        exchange.block1_to_ack = Some(block1.clone());
        Ok(Some(assembled))
    }

    fn reply_continue(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: &CoapRequest<Endpoint>,
        block1: &BlockValue,
    ) {
        let mut response = CoapResponse::from_request(&request.message);
        response.set_status(ResponseType::Continue);
        set_block(
            &mut response.message,
            CoapOption::Block1,
            &BlockValue {
                num: block1.num,
                more: true,
                szx: block1.szx,
            },
        );
        self.send_down_response(exchange, response);
    }

    /// Serves the next chunk of an ongoing outbound response transfer.
    fn continue_response_transfer(
        &self,
        exchange: &mut Exchange<Endpoint>,
        mut request: CoapRequest<Endpoint>,
        key: &TransferKey<Endpoint>,
        status_arc: &Arc<Mutex<Block2Status>>,
        requested: &BlockValue,
    ) {
        let mut status = lock(status_arc);
        match status.crop_response_chunk(requested, self.config.bulk_blocks) {
            Ok((payload, block)) => {
                let complete = status.complete;
                let template = status.response.clone();
                status.prepare_cleanup(self.config.status_lifetime);
                drop(status);

                let mut response =
                    CoapResponse::from_request(&request.message);
                if let Some(template) = template {
                    clone_response_template(&mut response.message, &template);
                }
                response.message.payload = payload;
                set_block(&mut response.message, CoapOption::Block2, &block);

                if complete {
                    if let Some(done) = self.registry.block2.remove(key) {
                        lock(&done).finish(&TransferEnd::Completed);
                    }
                }
                self.send_down_response(exchange, response);
            }
            Err(err) => {
                drop(status);
                if let Some(dropped) = self.registry.block2.remove(key) {
                    lock(&dropped).finish(&TransferEnd::Cancelled);
                }
                let echoed = requested.clone();
                if request.apply_from_error(err) {
                    if let Some(mut response) = request.response.take() {
                        set_block(
                            &mut response.message,
                            CoapOption::Block2,
                            &echoed,
                        );
                        self.send_down_response(exchange, response);
                    }
                } else {
                    coap_warn!("dropping chunk request without a response slot");
                }
            }
        }
    }

    /// Converts a handling failure into an error response to the peer and
    /// sends it. 4.13 replies carry our body cap as a Size1 hint.
    fn reject(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: &mut CoapRequest<Endpoint>,
        err: HandlingError,
    ) {
        let too_large =
            err.code == Some(ResponseType::RequestEntityTooLarge);
        if request.apply_from_error(err) {
            if let Some(mut response) = request.response.take() {
                if too_large {
                    response.message.set_size_hint(
                        CoapOption::Size1,
                        self.config.max_resource_body_size as u32,
                    );
                }
                self.send_down_response(exchange, response);
                return;
            }
        }
        coap_warn!("dropping block message with unreportable error");
    }

    fn send_down_response(
        &self,
        exchange: &mut Exchange<Endpoint>,
        response: CoapResponse,
    ) {
        if let Err(err) = self.lower.send_response(exchange, response) {
            coap_warn!("response send failed: {}", err);
        }
    }

    // ---- outbound response ----------------------------------------------

    /// Entry point for responses handed down by the application.
    pub fn send_response(
        &self,
        exchange: &mut Exchange<Endpoint>,
        mut response: CoapResponse,
    ) -> Result<(), SendError> {
        if let Some(block1) = exchange.block1_to_ack.take() {
            set_block(&mut response.message, CoapOption::Block1, &block1);
        }

        let request_block2 = exchange
            .request
            .as_ref()
            .and_then(|r| get_block(&r.message, CoapOption::Block2));

        if let Some(response_block2) =
            get_block(&response.message, CoapOption::Block2)
        {
            // The application fragments on its own; only check that it
            // produced the block the peer asked for.
            if let Some(request_block2) = &request_block2 {
                if response_block2.num != request_block2.num {
                    return self.send_resource_error(
                        exchange,
                        request_block2,
                        &response_block2,
                    );
                }
            }
            return self.lower.send_response(exchange, response);
        }

        if let Some(request_block2) = &request_block2 {
            if request_block2.num > 0 {
                return self.send_cropped_response(
                    exchange,
                    response,
                    request_block2,
                );
            }
        }

        let large =
            response.message.payload.len() > self.config.max_message_size;
        if (large || request_block2.is_some())
            && !response.message.payload.is_empty()
        {
            return self.start_response_transfer(
                exchange,
                response,
                request_block2.as_ref(),
            );
        }

        self.lower.send_response(exchange, response)
    }

    /// Serves an explicit block-N request from the application's full-body
    /// response, statelessly.
    fn send_cropped_response(
        &self,
        exchange: &mut Exchange<Endpoint>,
        response: CoapResponse,
        requested: &BlockValue,
    ) -> Result<(), SendError> {
        let mut scratch = Block2Status::new_outbound(
            response.message.clone(),
            requested.szx,
            self.config.status_lifetime,
        );
        match scratch.crop_response_chunk(requested, self.config.bulk_blocks)
        {
            Ok((payload, block)) => {
                let mut out = response;
                out.message.payload = payload;
                set_block(&mut out.message, CoapOption::Block2, &block);
                self.lower.send_response(exchange, out)
            }
            Err(err) => {
                let mut out = response;
                out.set_status(
                    err.code.unwrap_or(ResponseType::InternalServerError),
                );
                out.message.set_content_format(0);
                out.message.payload = err.message.into_bytes();
                set_block(&mut out.message, CoapOption::Block2, requested);
                self.lower.send_response(exchange, out)
            }
        }
    }

    /// Starts (or completes in one message) an outbound response transfer.
    fn start_response_transfer(
        &self,
        exchange: &mut Exchange<Endpoint>,
        response: CoapResponse,
        requested: Option<&BlockValue>,
    ) -> Result<(), SendError> {
        let key = match exchange.request.as_ref() {
            Some(request) => TransferKey::of_request(request),
            None => TransferKey::of_packet(&exchange.peer, &response.message),
        };
        let szx = self.negotiated_szx(requested);
        let total = response.message.payload.len();
        coap_info!(
            "fragmenting {} byte response body at szx {}",
            total,
            szx
        );

        let mut status = Block2Status::new_outbound(
            response.message.clone(),
            szx,
            self.config.status_lifetime,
        );
        let first = BlockValue {
            num: 0,
            more: false,
            szx,
        };
        let (payload, block) = status
            .crop_response_chunk(&first, self.config.bulk_blocks)
            .map_err(|err| SendError::new(err))?;

        let mut out = response;
        out.message.payload = payload;
        set_block(&mut out.message, CoapOption::Block2, &block);
        out.message.set_size_hint(CoapOption::Size2, total as u32);

        if block.more {
            for observer in exchange.observers.drain(..) {
                status.add_observer(observer);
            }
            self.registry
                .block2
                .insert(key, Arc::new(Mutex::new(status)));
        } else {
            status.finish(&TransferEnd::Completed);
            for observer in exchange.observers.drain(..) {
                observer(&TransferEnd::Completed);
            }
        }
        self.lower.send_response(exchange, out)
    }

    fn negotiated_szx(&self, requested: Option<&BlockValue>) -> u8 {
        match requested {
            Some(block) if block.is_bert() => BERT_SZX,
            Some(block) => block.szx.min(self.config.preferred_szx()),
            None if self.config.bert_enabled() => BERT_SZX,
            None => self.config.preferred_szx(),
        }
    }

    /// The application answered a block-N request with a block other than
    /// the one the peer asked for; report the implementation error instead.
    fn send_resource_error(
        &self,
        exchange: &mut Exchange<Endpoint>,
        requested: &BlockValue,
        produced: &BlockValue,
    ) -> Result<(), SendError> {
        let err = HandlingError::resource_impl_error(format!(
            "resource produced block {} for requested block {}",
            produced.num, requested.num
        ));
        let mut response = match exchange.request.as_ref() {
            Some(request) => CoapResponse::from_request(&request.message),
            None => CoapResponse::from_request(&Packet::new()),
        };
        response.set_status(ResponseType::InternalServerError);
        response.message.set_content_format(0);
        response.message.payload = err.message.into_bytes();
        self.lower.send_response(exchange, response)
    }

    // ---- outbound request -----------------------------------------------

    /// Entry point for requests handed down by a client.
    pub fn send_request(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: CoapRequest<Endpoint>,
    ) -> Result<(), SendError> {
        let key = TransferKey::of_packet(&exchange.peer, &request.message);
        exchange.request = Some(request.clone());

        if let Some(block2) = get_block(&request.message, CoapOption::Block2)
        {
            if block2.num > 0 {
                return self.send_random_access_request(
                    exchange, request, &key, &block2,
                );
            }
        }

        // A new exchange for the key preempts an ongoing response
        // transfer, e.g. the download of a stale notification
        // (RFC 7959 §2.4).
        if let Some(stale) = self.registry.block2.remove(&key) {
            coap_debug!("new request preempts in-flight response transfer");
            lock(&stale).finish(&TransferEnd::Cancelled);
        }

        if request.message.payload.len() > self.config.max_message_size {
            return self.start_request_transfer(exchange, request, key);
        }
        self.lower.send_request(exchange, request)
    }

    /// Fragments an outbound body and sends its first message.
    fn start_request_transfer(
        &self,
        exchange: &mut Exchange<Endpoint>,
        mut request: CoapRequest<Endpoint>,
        key: TransferKey<Endpoint>,
    ) -> Result<(), SendError> {
        let szx = if self.config.bert_enabled() {
            BERT_SZX
        } else {
            self.config.preferred_szx()
        };
        let body = mem::take(&mut request.message.payload);
        let total = body.len();
        coap_info!(
            "fragmenting {} byte request body at szx {}",
            total,
            szx
        );

        let mut status =
            Block1Status::new_outbound(body, szx, self.config.status_lifetime);
        for observer in exchange.observers.drain(..) {
            status.add_observer(observer);
        }
        let (payload, block) = status.next_fragment(self.config.bulk_blocks);

        request.message.payload = payload;
        set_block(&mut request.message, CoapOption::Block1, &block);
        request
            .message
            .set_size_hint(CoapOption::Size1, total as u32);

        self.registry
            .block1
            .insert(key.clone(), Arc::new(Mutex::new(status)));

        match self.lower.send_request(exchange, request) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(aborted) = self.registry.block1.remove(&key) {
                    lock(&aborted)
                        .finish(&TransferEnd::SendFailed(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Sends an explicit block-N request. The response passes upward
    /// unassembled through a pass-through status.
    fn send_random_access_request(
        &self,
        exchange: &mut Exchange<Endpoint>,
        mut request: CoapRequest<Endpoint>,
        key: &TransferKey<Endpoint>,
        block2: &BlockValue,
    ) -> Result<(), SendError> {
        let mut status = Block2Status::new_random_access(
            block2.szx,
            self.config.status_lifetime,
        );
        for observer in exchange.observers.drain(..) {
            status.add_observer(observer);
        }
        self.registry
            .block2
            .insert(key.clone(), Arc::new(Mutex::new(status)));

        if !self.config.bert_enabled() {
            return self.lower.send_request(exchange, request);
        }

        // With bulking enabled, an ongoing upload for this key is resumed
        // from the requested sub-block. The resumed sequence is always
        // tagged with Block1 NUM 0.
        match self.registry.block1.get(key) {
            Some(status_arc) => {
                let (payload, block) = {
                    let mut upload = lock(&status_arc);
                    upload.prepare_cleanup(self.config.status_lifetime);
                    upload.fragment_at(block2.num, self.config.bulk_blocks)
                };
                request.message.payload = payload;
                set_block(
                    &mut request.message,
                    CoapOption::Block1,
                    &BlockValue {
                        num: 0,
                        more: block.more,
                        szx: BERT_SZX,
                    },
                );
                self.lower.send_request(exchange, request)
            }
            None => {
                coap_warn!(
                    "dropping random block access without prior transfer context"
                );
                Ok(())
            }
        }
    }

    // ---- inbound response -----------------------------------------------

    /// Entry point for responses arriving from the transport.
    pub fn receive_response(
        &self,
        exchange: &mut Exchange<Endpoint>,
        response: CoapResponse,
    ) {
        let request = match exchange.request.clone() {
            Some(request) => request,
            None => {
                // Nothing to correlate against; not ours to interpret.
                self.upper.receive_response(exchange, response);
                return;
            }
        };
        let key = TransferKey::of_packet(&exchange.peer, &request.message);

        if get_block(&response.message, CoapOption::Block1).is_some() {
            if response.get_status() == ResponseType::Continue {
                self.continue_request_transfer(exchange, &key);
                return;
            }
            // Terminal response for the upload, successful or not.
            if let Some(done) = self.registry.block1.remove(&key) {
                lock(&done).finish(&TransferEnd::Completed);
            }
        }

        if let Some(block2) = get_block(&response.message, CoapOption::Block2)
        {
            self.receive_download_block(
                exchange, &request, &key, response, &block2,
            );
            return;
        }

        self.upper.receive_response(exchange, response);
    }

    /// The peer acknowledged our blocks with 2.31; send the next bulk.
    fn continue_request_transfer(
        &self,
        exchange: &mut Exchange<Endpoint>,
        key: &TransferKey<Endpoint>,
    ) {
        let status_arc = match self.registry.block1.get(key) {
            Some(status) => status,
            None => {
                coap_warn!("continue response without upload in progress");
                return;
            }
        };
        let request = match exchange.request.as_ref() {
            Some(request) => request.clone(),
            None => return,
        };

        let (payload, block) = {
            let mut status = lock(&status_arc);
            if status.complete {
                // Spurious acknowledgement after the final block.
                return;
            }
            let fragment = status.next_fragment(self.config.bulk_blocks);
            status.prepare_cleanup(self.config.status_lifetime);
            fragment
        };

        // Destination and token come from the original request so the
        // transfer stays traceable end to end.
        let mut next = request;
        next.message.payload = payload;
        next.message.clear_option(CoapOption::Size1);
        set_block(&mut next.message, CoapOption::Block1, &block);

        if let Err(err) = self.lower.send_request(exchange, next) {
            coap_warn!("aborting upload: {}", err);
            if let Some(aborted) = self.registry.block1.remove(key) {
                lock(&aborted).finish(&TransferEnd::SendFailed(err));
            }
        }
    }

    /// Handles one block of an inbound download.
    fn receive_download_block(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: &CoapRequest<Endpoint>,
        key: &TransferKey<Endpoint>,
        mut response: CoapResponse,
        block2: &BlockValue,
    ) {
        let status_arc = match self.registry.block2.get(key) {
            Some(status) => status,
            None if block2.num == 0 && block2.more => {
                let mut status = Block2Status::new_inbound(
                    block2.szx,
                    self.config.max_resource_body_size,
                    self.config.status_lifetime,
                );
                status.etag =
                    response.message.get_etag().map(|etag| etag.to_vec());
                status.notification =
                    response.message.get_observe_value().is_some();
                for observer in exchange.observers.drain(..) {
                    status.add_observer(observer);
                }
                let status = Arc::new(Mutex::new(status));
                self.registry
                    .block2
                    .insert(key.clone(), Arc::clone(&status));
                status
            }
            None if block2.num == 0 => {
                // A body that fits one block; nothing to assemble.
                self.upper.receive_response(exchange, response);
                return;
            }
            None => {
                coap_warn!(
                    "dropping block response without transfer state"
                );
                return;
            }
        };

        let mut status = lock(&status_arc);

        if status.random_access {
            drop(status);
            if let Some(done) = self.registry.block2.remove(key) {
                lock(&done).finish(&TransferEnd::Completed);
            }
            self.upper.receive_response(exchange, response);
            return;
        }

        let etag = response.message.get_etag().map(|etag| etag.to_vec());
        let format = response.message.get_content_format();
        let is_notification =
            response.message.get_observe_value().is_some();

        // A fresh notification for the same resource starts the body over.
        if block2.num == 0
            && status.current_num > 0
            && (status.notification || is_notification)
        {
            coap_debug!("newer notification replaces in-flight download");
            status.restart(etag.clone(), format);
        }

        if status.body_len() == 0 {
            status.etag = etag;
            status.content_format = format;
            status.notification = is_notification;
        } else if status.etag != etag || status.content_format != format {
            // The representation changed under us; what was assembled so
            // far belongs to the old one.
            coap_debug!("representation changed mid-download, restarting");
            status.restart(etag, format);
            if block2.num != 0 {
                drop(status);
                let from_start = BlockValue {
                    num: 0,
                    more: false,
                    szx: block2.szx,
                };
                self.request_next_download_block(
                    exchange, request, key, &from_start,
                );
                return;
            }
        }

        if block2.num != status.current_num {
            coap_warn!(
                "out-of-order download block {}, expected {}",
                block2.num,
                status.current_num
            );
            drop(status);
            if let Some(dropped) = self.registry.block2.remove(key) {
                lock(&dropped).finish(&TransferEnd::Cancelled);
            }
            return;
        }

        if status.append(&response.message.payload).is_err() {
            coap_warn!("download exceeded the configured body cap, abandoning");
            drop(status);
            if let Some(dropped) = self.registry.block2.remove(key) {
                lock(&dropped).finish(&TransferEnd::Cancelled);
            }
            return;
        }
        status.prepare_cleanup(self.config.status_lifetime);

        if block2.more {
            let next = BlockValue {
                num: status.current_num,
                more: false,
                szx: block2.szx,
            };
            drop(status);
            self.request_next_download_block(exchange, request, key, &next);
            return;
        }

        let body = status.take_body();
        drop(status);
        if let Some(done) = self.registry.block2.remove(key) {
            lock(&done).finish(&TransferEnd::Completed);
        }
        response.message.payload = body;
        response.message.clear_option(CoapOption::Block2);
        self.upper.receive_response(exchange, response);
    }

    fn request_next_download_block(
        &self,
        exchange: &mut Exchange<Endpoint>,
        request: &CoapRequest<Endpoint>,
        key: &TransferKey<Endpoint>,
        next: &BlockValue,
    ) {
        let mut next_request = request.clone();
        next_request.message.payload.clear();
        next_request.message.clear_option(CoapOption::Block1);
        next_request.message.clear_option(CoapOption::Size1);
        next_request.message.clear_option(CoapOption::Observe);
        set_block(&mut next_request.message, CoapOption::Block2, next);

        if let Err(err) = self.lower.send_request(exchange, next_request) {
            coap_warn!("aborting download: {}", err);
            if let Some(aborted) = self.registry.block2.remove(key) {
                lock(&aborted).finish(&TransferEnd::SendFailed(err));
            }
        }
    }
}
