//! Node-OTA orchestrator: the gateway side of the push protocol.
//!
//! One session exists at a time. The dispatcher feeds acks in through
//! `handle_*`; a dedicated worker task drives the transfer, waiting on the
//! `node_ready` / `chunk_acked` condition signals with bounded timeouts.
//! Exactly one chunk is ever in flight: chunk *i+1* is not sent until the
//! OK ack for chunk *i* arrived. That stop-and-wait is the only flow
//! control the mesh link gets.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use anyhow::Result;
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, warn};

use crate::boot::{BootManager, Partition};
use crate::config::{OtaTimings, OTA_CHUNK_SIZE};
use crate::device::DeviceType;
use crate::gateway::mqtt::{topics, Publisher};
use crate::gateway::{send_frame, Counters};
use crate::protocol::payloads::{
    AckStatus, OtaAbort, OtaAck, OtaBegin, OtaComplete, OtaData, OtaEnd, OtaFailed, OtaRequest,
    OTA_DATA_MAX,
};
use crate::protocol::Payload;
use crate::transport::Transport;
use crate::Mac;

/// Chunk validation algorithm shared with the nodes.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Where the staged image lives while chunks are pushed out.
pub enum OtaSource {
    /// Whole image handed over in one buffer (small images only).
    Ram(Vec<u8>),
    /// Image staged in the gateway's inactive boot partition.
    Partition { part: Partition, size: u32 },
}

impl OtaSource {
    fn len(&self) -> u32 {
        match self {
            OtaSource::Ram(buf) => buf.len() as u32,
            OtaSource::Partition { size, .. } => *size,
        }
    }

    fn read_chunk(
        &self,
        boot: &Mutex<Box<dyn BootManager>>,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>> {
        match self {
            OtaSource::Ram(buf) => {
                let start = offset as usize;
                Ok(buf[start..start + len].to_vec())
            }
            OtaSource::Partition { part, .. } => {
                let mut out = vec![0u8; len];
                boot.lock().unwrap().read(*part, offset, &mut out)?;
                Ok(out)
            }
        }
    }
}

/// Session lifecycle. `Staging` covers the flash-mode upload window before
/// the push begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Staging,
    Starting,
    Sending,
    Finishing,
    Complete,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed | SessionState::Aborted)
    }
}

/// Published view of the OTA pipeline, one tagged variant per phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaStatus {
    Idle,
    Running { target: Mac, progress: u8, message: String },
    Complete { target: Mac },
    Failed { target: Mac, reason: String },
}

impl OtaStatus {
    pub fn in_progress(&self) -> bool {
        matches!(self, OtaStatus::Running { .. })
    }

    pub fn progress_percent(&self) -> u8 {
        match self {
            OtaStatus::Idle => 0,
            OtaStatus::Running { progress, .. } => *progress,
            OtaStatus::Complete { .. } => 100,
            OtaStatus::Failed { .. } => 0,
        }
    }

    /// The flat record polled over HTTP.
    pub fn to_json(&self) -> serde_json::Value {
        let (message, success, error, target) = match self {
            OtaStatus::Idle => (String::from("idle"), false, false, None),
            OtaStatus::Running { target, message, .. } => {
                (message.clone(), false, false, Some(*target))
            }
            OtaStatus::Complete { target } => (String::from("update complete"), true, false, Some(*target)),
            OtaStatus::Failed { target, reason } => {
                (format!("update failed: {reason}"), false, true, Some(*target))
            }
        };
        serde_json::json!({
            "in_progress": self.in_progress(),
            "progress_percent": self.progress_percent(),
            "status_message": message,
            "success": success,
            "error": error,
            "target_mac": target,
        })
    }

    /// The compact record published to MQTT on every transition.
    pub fn mqtt_json(&self) -> serde_json::Value {
        let (status, target) = match self {
            OtaStatus::Idle => ("idle", None),
            OtaStatus::Running { target, .. } => ("running", Some(*target)),
            OtaStatus::Complete { target } => ("complete", Some(*target)),
            OtaStatus::Failed { target, .. } => ("failed", Some(*target)),
        };
        serde_json::json!({
            "node": target,
            "status": status,
            "progress": self.progress_percent(),
        })
    }
}

struct SessionInner {
    state: SessionState,
    target: Mac,
    total_size: u32,
    chunk_size: u16,
    total_chunks: u16,
    current_chunk: u16,
    crc32: u32,
    retry_count: u8,
    last_activity: Instant,
    source: Option<OtaSource>,
    // Dispatcher -> worker handoff slots.
    node_ready: bool,
    last_ack: Option<(u16, AckStatus)>,
    completed: Option<u32>,
    failed: Option<String>,
}

impl SessionInner {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            target: Mac([0; 6]),
            total_size: 0,
            chunk_size: OTA_CHUNK_SIZE,
            total_chunks: 0,
            current_chunk: 0,
            crc32: 0,
            retry_count: 0,
            last_activity: Instant::now(),
            source: None,
            node_ready: false,
            last_ack: None,
            completed: None,
            failed: None,
        }
    }

    fn reset_for(&mut self, target: Mac, total_size: u32, crc32: u32, source: OtaSource) {
        *self = Self::idle();
        self.state = SessionState::Starting;
        self.target = target;
        self.total_size = total_size;
        self.total_chunks = total_size.div_ceil(u32::from(OTA_CHUNK_SIZE)) as u16;
        self.crc32 = crc32;
        self.source = Some(source);
    }

    fn teardown(&mut self) {
        self.source = None;
    }
}

/// Everything the worker needs from the gateway runtime.
pub(crate) struct OtaWorkerCtx {
    pub transport: Arc<dyn Transport>,
    pub publisher: Arc<dyn Publisher>,
    pub boot: Arc<Mutex<Box<dyn BootManager>>>,
    pub counters: Arc<Counters>,
    pub seq: Arc<AtomicU8>,
}

impl OtaWorkerCtx {
    fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

enum ChunkOutcome {
    Acked,
    SessionDead,
}

/// Outcome of one bounded wait on a condition signal.
enum WaitOutcome {
    Ready,
    Acked,
    Resend,
    Dead(Option<String>),
}

/// Gateway-side OTA session owner.
pub struct OtaOrchestrator {
    timings: OtaTimings,
    session: Mutex<SessionInner>,
    node_ready_cv: Condvar,
    chunk_acked_cv: Condvar,
    status: Mutex<OtaStatus>,
}

impl OtaOrchestrator {
    pub fn new(timings: OtaTimings) -> Self {
        Self {
            timings,
            session: Mutex::new(SessionInner::idle()),
            node_ready_cv: Condvar::new(),
            chunk_acked_cv: Condvar::new(),
            status: Mutex::new(OtaStatus::Idle),
        }
    }

    pub fn status(&self) -> OtaStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state(), SessionState::Idle) && !self.state().is_terminal()
    }

    /// Stage a whole in-RAM image and arm the session. The caller then
    /// spawns [`run_worker`](Self::run_worker) on the OTA task.
    pub fn begin_ram(&self, target: Mac, image: Vec<u8>) -> Result<()> {
        if image.is_empty() {
            anyhow::bail!("empty firmware image");
        }
        let crc = CRC32.checksum(&image);
        let total = image.len() as u32;
        self.arm(target, total, crc, OtaSource::Ram(image))
    }

    /// Arm the session from an already-staged partition (flash mode).
    pub fn begin_partition(&self, target: Mac, part: Partition, size: u32, crc32: u32) -> Result<()> {
        if size == 0 {
            anyhow::bail!("empty staged image");
        }
        self.arm(target, size, crc32, OtaSource::Partition { part, size })
    }

    fn arm(&self, target: Mac, total_size: u32, crc32: u32, source: OtaSource) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if !matches!(session.state, SessionState::Idle) && !session.state.is_terminal() {
            anyhow::bail!("OTA session already in progress for {}", session.target);
        }
        session.reset_for(target, total_size, crc32, source);
        info!(
            "OTA session armed: target={} size={} chunks={} crc=0x{:08X}",
            target, total_size, session.total_chunks, crc32
        );
        Ok(())
    }

    /// Reserve the session for a flash-mode upload that is still streaming
    /// in. Keeps a second `ota_start` from racing the upload.
    pub fn reserve_staging(&self, target: Mac) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        if !matches!(session.state, SessionState::Idle) && !session.state.is_terminal() {
            anyhow::bail!("OTA session already in progress for {}", session.target);
        }
        *session = SessionInner::idle();
        session.state = SessionState::Staging;
        session.target = target;
        Ok(())
    }

    /// Target of a live staging reservation, if any.
    pub fn staging_target(&self) -> Option<Mac> {
        let session = self.session.lock().unwrap();
        (session.state == SessionState::Staging).then_some(session.target)
    }

    /// Release a staging reservation that never became a session.
    pub fn release_staging(&self) {
        let mut session = self.session.lock().unwrap();
        if session.state == SessionState::Staging {
            *session = SessionInner::idle();
        }
    }

    /// External abort: any non-terminal session transitions to `Aborted`,
    /// the node is told, and the worker's waits are unblocked.
    pub fn abort(&self, transport: &dyn Transport, counters: &Counters, seq: u8) {
        let target = {
            let mut session = self.session.lock().unwrap();
            if session.state == SessionState::Idle || session.state.is_terminal() {
                return;
            }
            session.state = SessionState::Aborted;
            session.teardown();
            self.node_ready_cv.notify_all();
            self.chunk_acked_cv.notify_all();
            session.target
        };
        warn!("OTA session aborted by operator (target {target})");
        let abort = Payload::OtaAbort(OtaAbort { device_type: DeviceType::Unknown });
        if let Err(err) = send_frame(transport, target, &abort, seq, counters) {
            warn!("failed to send OtaAbort to {target}: {err}");
        }
        self.set_status(OtaStatus::Failed { target, reason: String::from("aborted") }, None);
    }

    /// Dispatcher entry: an `OtaAck` arrived from the target.
    pub fn handle_ack(&self, from: Mac, ack: OtaAck) {
        let mut session = self.session.lock().unwrap();
        if session.state.is_terminal() || session.state == SessionState::Idle {
            debug!("stray OtaAck from {from} ignored");
            return;
        }
        if from != session.target {
            warn!("OtaAck from {from} but session targets {}", session.target);
            return;
        }
        session.last_activity = Instant::now();
        match ack.status {
            AckStatus::Ready => {
                session.node_ready = true;
                session.retry_count = 0;
                self.node_ready_cv.notify_all();
            }
            _ => {
                session.last_ack = Some((ack.chunk_index, ack.status));
                self.chunk_acked_cv.notify_all();
            }
        }
    }

    /// Dispatcher entry: the node reports the new image is live.
    pub fn handle_complete(&self, from: Mac, complete: OtaComplete) {
        let mut session = self.session.lock().unwrap();
        if from != session.target || session.state.is_terminal() {
            debug!("OtaComplete from {from} outside an active session");
            return;
        }
        session.last_activity = Instant::now();
        session.completed = Some(complete.new_version);
        self.node_ready_cv.notify_all();
        self.chunk_acked_cv.notify_all();
    }

    /// Dispatcher entry: the node reports a failure.
    pub fn handle_failed(&self, from: Mac, failed: &OtaFailed) {
        let mut session = self.session.lock().unwrap();
        if from != session.target || session.state.is_terminal() {
            debug!("OtaFailed from {from} outside an active session");
            return;
        }
        session.last_activity = Instant::now();
        session.failed = Some(format!("{:?}: {}", failed.code, failed.message));
        self.node_ready_cv.notify_all();
        self.chunk_acked_cv.notify_all();
    }

    /// Legacy pull mode: serve one solicited chunk out of the staged source.
    pub fn handle_chunk_request(
        &self,
        from: Mac,
        req: OtaRequest,
        boot: &Mutex<Box<dyn BootManager>>,
    ) -> Option<OtaData> {
        let mut session = self.session.lock().unwrap();
        if from != session.target {
            return None;
        }
        let source = session.source.as_ref()?;
        let total = source.len();
        if req.offset >= total || req.length as usize > OTA_DATA_MAX {
            return None;
        }
        let len = (req.length as u32).min(total - req.offset) as usize;
        let data = match source.read_chunk(boot, req.offset, len) {
            Ok(data) => data,
            Err(err) => {
                warn!("pull chunk read failed at {}: {err}", req.offset);
                return None;
            }
        };
        session.last_activity = Instant::now();
        Some(OtaData {
            offset: req.offset,
            last: req.offset + len as u32 >= total,
            data: heapless::Vec::from_slice(&data).ok()?,
        })
    }

    /// The OTA worker task body: drives one armed session to a terminal
    /// state, publishing status along the way.
    pub(crate) fn run_worker(&self, ctx: &OtaWorkerCtx) {
        let (target, total_size, chunk_size, total_chunks) = {
            let session = self.session.lock().unwrap();
            if session.state != SessionState::Starting {
                warn!("OTA worker started without an armed session");
                return;
            }
            (session.target, session.total_size, session.chunk_size, session.total_chunks)
        };

        self.set_status(
            OtaStatus::Running {
                target,
                progress: 0,
                message: String::from("waiting for node"),
            },
            Some(ctx),
        );

        if !self.send_begin_until_ready(ctx, target) {
            return;
        }

        self.transition(SessionState::Sending);
        self.set_status(
            OtaStatus::Running { target, progress: 0, message: String::from("sending") },
            Some(ctx),
        );

        let mut published_decile = 0u8;
        for chunk in 0..total_chunks {
            let offset = u32::from(chunk) * u32::from(chunk_size);
            let len = u32::from(chunk_size).min(total_size - offset) as usize;
            let data = {
                let session = self.session.lock().unwrap();
                let Some(source) = session.source.as_ref() else {
                    return; // torn down by abort
                };
                match source.read_chunk(&ctx.boot, offset, len) {
                    Ok(data) => data,
                    Err(err) => {
                        drop(session);
                        self.fail(ctx, target, format!("staged image read failed: {err}"));
                        return;
                    }
                }
            };
            let payload = Payload::OtaData(OtaData {
                offset,
                last: chunk + 1 == total_chunks,
                data: match heapless::Vec::from_slice(&data) {
                    Ok(data) => data,
                    Err(_) => {
                        self.fail(ctx, target, String::from("chunk exceeds frame capacity"));
                        return;
                    }
                },
            });

            match self.push_chunk(ctx, target, chunk, &payload) {
                ChunkOutcome::Acked => {}
                ChunkOutcome::SessionDead => return,
            }

            {
                let mut session = self.session.lock().unwrap();
                session.current_chunk = chunk + 1;
                session.retry_count = 0;
            }

            let progress = ((u32::from(chunk) + 1) * 100 / u32::from(total_chunks)) as u8;
            if progress / 10 > published_decile {
                published_decile = progress / 10;
                info!("OTA {target}: {progress}% ({}/{} chunks)", chunk + 1, total_chunks);
                self.set_status(
                    OtaStatus::Running {
                        target,
                        progress,
                        message: format!("sending chunk {}/{}", chunk + 1, total_chunks),
                    },
                    Some(ctx),
                );
            }
        }

        self.transition(SessionState::Finishing);
        self.set_status(
            OtaStatus::Running { target, progress: 100, message: String::from("verifying") },
            Some(ctx),
        );

        let (crc32, total_chunks) = {
            let session = self.session.lock().unwrap();
            (session.crc32, session.total_chunks)
        };
        let end = Payload::OtaEnd(OtaEnd { target, total_chunks, crc32 });
        if let Err(err) =
            send_frame(ctx.transport.as_ref(), target, &end, ctx.next_seq(), &ctx.counters)
        {
            self.fail(ctx, target, format!("OtaEnd send failed: {err}"));
            return;
        }

        match self.wait_for_completion() {
            Ok(new_version) => {
                self.transition(SessionState::Complete);
                {
                    let mut session = self.session.lock().unwrap();
                    session.teardown();
                }
                info!(
                    "OTA {target}: complete, node now runs {}",
                    crate::Version::unpack(new_version)
                );
                self.set_status(OtaStatus::Complete { target }, Some(ctx));
            }
            Err(reason) => self.fail(ctx, target, reason),
        }
    }

    /// Send OtaBegin and wait for the READY ack, resending up to the cap.
    fn send_begin_until_ready(&self, ctx: &OtaWorkerCtx, target: Mac) -> bool {
        let begin = {
            let session = self.session.lock().unwrap();
            Payload::OtaBegin(OtaBegin {
                target,
                total_size: session.total_size,
                chunk_size: session.chunk_size,
                total_chunks: session.total_chunks,
                crc32: session.crc32,
            })
        };

        for attempt in 0..=self.timings.max_retries {
            if let Err(err) = send_frame(
                ctx.transport.as_ref(),
                target,
                &begin,
                ctx.next_seq(),
                &ctx.counters,
            ) {
                warn!("OtaBegin send failed (attempt {attempt}): {err}");
            }
            let deadline = Instant::now() + self.timings.begin_ack_timeout;
            let outcome = {
                let mut session = self.session.lock().unwrap();
                loop {
                    if session.state.is_terminal() {
                        break WaitOutcome::Dead(None);
                    }
                    if let Some(reason) = session.failed.take() {
                        break WaitOutcome::Dead(Some(reason));
                    }
                    if session.node_ready {
                        break WaitOutcome::Ready;
                    }
                    // A WRITE_ERROR/ABORT ack can arrive instead of READY.
                    if let Some((_, status)) = session.last_ack.take() {
                        if matches!(status, AckStatus::WriteError | AckStatus::Abort) {
                            break WaitOutcome::Dead(Some(format!(
                                "node refused update ({status:?})"
                            )));
                        }
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break WaitOutcome::Resend;
                    }
                    let (guard, _) = self
                        .node_ready_cv
                        .wait_timeout(session, deadline - now)
                        .unwrap();
                    session = guard;
                }
            };
            match outcome {
                WaitOutcome::Ready => return true,
                WaitOutcome::Resend | WaitOutcome::Acked => {
                    debug!("no READY from {target}, attempt {}", attempt + 1);
                }
                WaitOutcome::Dead(reason) => {
                    if let Some(reason) = reason {
                        self.fail(ctx, target, reason);
                    }
                    return false;
                }
            }
        }
        self.fail(ctx, target, String::from("node never acknowledged OtaBegin"));
        false
    }

    /// Send one chunk and wait for its OK, resending on timeout or
    /// CRC_ERROR up to the retry cap. Returns when the chunk is acked or
    /// the session has died.
    fn push_chunk(
        &self,
        ctx: &OtaWorkerCtx,
        target: Mac,
        chunk: u16,
        payload: &Payload,
    ) -> ChunkOutcome {
        for _attempt in 0..=self.timings.max_retries {
            if let Err(err) = send_frame(
                ctx.transport.as_ref(),
                target,
                payload,
                ctx.next_seq(),
                &ctx.counters,
            ) {
                warn!("chunk {chunk} send failed: {err}");
            }
            let deadline = Instant::now() + self.timings.chunk_ack_timeout;
            let outcome = {
                let mut session = self.session.lock().unwrap();
                loop {
                    if session.state.is_terminal() {
                        break WaitOutcome::Dead(None);
                    }
                    if let Some(reason) = session.failed.take() {
                        break WaitOutcome::Dead(Some(reason));
                    }
                    if session.last_activity.elapsed() > self.timings.session_timeout {
                        break WaitOutcome::Dead(Some(String::from("session timeout")));
                    }
                    match session.last_ack.take() {
                        Some((index, AckStatus::Ok)) if index == chunk => {
                            break WaitOutcome::Acked;
                        }
                        Some((index, AckStatus::Ok)) => {
                            // Duplicate ack for an earlier chunk; keep waiting.
                            debug!("duplicate ack for chunk {index} while sending {chunk}");
                        }
                        Some((index, AckStatus::CrcError)) => {
                            debug!("node NAKed chunk {index} (CRC), resending {chunk}");
                            break WaitOutcome::Resend;
                        }
                        Some((_, AckStatus::WriteError)) => {
                            break WaitOutcome::Dead(Some(String::from(
                                "node flash write failed",
                            )));
                        }
                        Some((_, AckStatus::Abort)) => {
                            break WaitOutcome::Dead(Some(String::from(
                                "node aborted the session",
                            )));
                        }
                        Some((_, AckStatus::Ready)) | None => {}
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break WaitOutcome::Resend;
                    }
                    let (guard, _) = self
                        .chunk_acked_cv
                        .wait_timeout(session, deadline - now)
                        .unwrap();
                    session = guard;
                }
            };
            match outcome {
                WaitOutcome::Acked => return ChunkOutcome::Acked,
                WaitOutcome::Resend | WaitOutcome::Ready => {
                    let mut session = self.session.lock().unwrap();
                    session.retry_count = session.retry_count.saturating_add(1);
                }
                WaitOutcome::Dead(reason) => {
                    if let Some(reason) = reason {
                        self.fail(ctx, target, reason);
                    }
                    return ChunkOutcome::SessionDead;
                }
            }
        }
        self.fail(
            ctx,
            target,
            format!("chunk {chunk} unacknowledged after {} retries", self.timings.max_retries),
        );
        ChunkOutcome::SessionDead
    }

    /// Wait for the node's OtaComplete after OtaEnd.
    fn wait_for_completion(&self) -> Result<u32, String> {
        let deadline = Instant::now() + self.timings.complete_timeout;
        let mut session = self.session.lock().unwrap();
        loop {
            if session.state.is_terminal() {
                return Err(String::from("session aborted"));
            }
            if let Some(version) = session.completed.take() {
                return Ok(version);
            }
            if let Some(reason) = session.failed.take() {
                return Err(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(String::from("node never confirmed activation"));
            }
            let (guard, _) = self
                .chunk_acked_cv
                .wait_timeout(session, deadline - now)
                .unwrap();
            session = guard;
        }
    }

    fn transition(&self, state: SessionState) {
        let mut session = self.session.lock().unwrap();
        if !session.state.is_terminal() {
            debug!("OTA session {:?} -> {:?}", session.state, state);
            session.state = state;
        }
    }

    fn fail(&self, ctx: &OtaWorkerCtx, target: Mac, reason: String) {
        warn!("OTA {target}: {reason}");
        {
            let mut session = self.session.lock().unwrap();
            if !session.state.is_terminal() {
                session.state = SessionState::Failed;
            }
            session.teardown();
        }
        self.set_status(OtaStatus::Failed { target, reason }, Some(ctx));
    }

    fn set_status(&self, status: OtaStatus, ctx: Option<&OtaWorkerCtx>) {
        *self.status.lock().unwrap() = status.clone();
        if let Some(ctx) = ctx {
            let payload = status.mqtt_json().to_string();
            if let Err(err) =
                ctx.publisher.publish(topics::NODE_OTA_STATUS, payload.as_bytes(), 0, false)
            {
                debug!("OTA status publish failed: {err}");
            }
        }
    }

    /// Global inactivity watchdog, ticked by the sweeper task: fails a
    /// stalled session even if the worker is stuck between waits.
    pub fn check_session_timeout(&self) -> bool {
        let mut session = self.session.lock().unwrap();
        let stalled = !session.state.is_terminal()
            && session.state != SessionState::Idle
            && session.state != SessionState::Staging
            && session.last_activity.elapsed() > self.timings.session_timeout;
        if stalled {
            session.failed = Some(String::from("session timeout"));
            self.node_ready_cv.notify_all();
            self.chunk_acked_cv.notify_all();
        }
        stalled
    }
}
