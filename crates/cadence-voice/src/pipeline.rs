//! Real-time audio send loop.
//!
//! One task per voice connection pulls frames from the input queue every
//! 20 ms, encodes raw PCM, seals and transmits. Items are delimited in-band
//! by tagged frames; each finished item produces one [`Completion`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cadence_codec::audio::opus::{CHANNELS, FRAME_SIZE};
use cadence_codec::{OpusEncoder, OpusError};
use cadence_models::Snowflake;
use cadence_transport::{SendStats, TransportError, VoiceSender};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pacer::{Pacer, PacerStats, FRAME_PERIOD};

/// Silence frames sent whenever transmission stops.
pub const SILENCE_BURST: usize = 5;

const COMPLETION_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub period: Duration,
    /// Busy-wait window before each deadline. Zero sleeps the whole way.
    pub spin_window: Duration,
    /// Consecutive empty ticks tolerated while playing.
    pub idle_ticks: u32,
    /// Silence keepalive cadence while stopped or paused.
    pub keepalive_interval: Duration,
    /// Frames buffered between sources and the loop.
    pub queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            period: FRAME_PERIOD,
            spin_window: Duration::from_millis(1),
            idle_ticks: 250,
            keepalive_interval: Duration::from_secs(5),
            queue_capacity: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Normal,
    /// Ends the current item normally.
    Skip,
    /// Ends the current item as cancelled.
    Cancel,
}

#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Interleaved s16 stereo at 48 kHz, one frame period long.
    Pcm(Vec<i16>),
    Opus(Bytes),
    Empty,
}

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub payload: FramePayload,
    /// Per-channel samples covered; advances the RTP timestamp.
    pub sample_count: u32,
    pub user_id: Option<Snowflake>,
    pub tag: FrameTag,
}

impl AudioFrame {
    pub fn pcm(samples: Vec<i16>) -> Self {
        Self {
            sample_count: (samples.len() / CHANNELS) as u32,
            payload: FramePayload::Pcm(samples),
            user_id: None,
            tag: FrameTag::Normal,
        }
    }

    pub fn opus(data: impl Into<Bytes>) -> Self {
        Self {
            payload: FramePayload::Opus(data.into()),
            sample_count: FRAME_SIZE as u32,
            user_id: None,
            tag: FrameTag::Normal,
        }
    }

    pub fn skip() -> Self {
        Self::marker(FrameTag::Skip)
    }

    pub fn cancel() -> Self {
        Self::marker(FrameTag::Cancel)
    }

    fn marker(tag: FrameTag) -> Self {
        Self {
            payload: FramePayload::Empty,
            sample_count: 0,
            user_id: None,
            tag,
        }
    }

    pub fn with_user(mut self, user_id: Option<Snowflake>) -> Self {
        self.user_id = user_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Finished,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: ItemOutcome,
    pub user_id: Option<Snowflake>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub pacer: PacerStats,
    pub send: SendStats,
}

enum Control {
    Play,
    Pause,
    Resume,
    Stop,
    Skip,
    Rebind(Box<VoiceSender>),
}

/// Current item generation. Frames stamped with an older one are dropped.
type ItemSlot = (u64, CancellationToken);

/// Producer side of the input queue, bound to one item generation.
#[derive(Clone)]
pub struct PipelineInput {
    tx: mpsc::Sender<(u64, AudioFrame)>,
    epoch: u64,
    token: CancellationToken,
}

impl PipelineInput {
    /// Queue a frame. Returns `false` once the item was stopped or skipped,
    /// or the pipeline is gone.
    pub async fn send(&self, frame: AudioFrame) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send((self.epoch, frame)) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Clone)]
pub struct PipelineHandle {
    input: mpsc::Sender<(u64, AudioFrame)>,
    control: mpsc::UnboundedSender<Control>,
    item: Arc<watch::Sender<ItemSlot>>,
    state: watch::Receiver<PipelineState>,
    stats: watch::Receiver<PipelineStats>,
    completions: broadcast::Sender<Completion>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// Producer for the next item. Take a fresh one after `stop` or `skip`.
    pub fn input(&self) -> PipelineInput {
        let (epoch, token) = self.item.borrow().clone();
        PipelineInput {
            tx: self.input.clone(),
            epoch,
            token,
        }
    }

    pub fn play(&self) {
        let _ = self.control.send(Control::Play);
    }

    pub fn pause(&self) {
        let _ = self.control.send(Control::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control.send(Control::Resume);
    }

    /// Drop everything queued, report the item cancelled and stop.
    pub fn stop(&self) {
        next_item(&self.item);
        let _ = self.control.send(Control::Stop);
    }

    /// Drop everything queued and report the item finished; keep playing.
    pub fn skip(&self) {
        next_item(&self.item);
        let _ = self.control.send(Control::Skip);
    }

    /// Swap the outbound sender after the voice session was re-established.
    pub fn rebind(&self, sender: VoiceSender) {
        let _ = self.control.send(Control::Rebind(Box::new(sender)));
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.completions.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        *self.stats.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Producer wired to a bare queue, for exercising sources without a loop.
#[cfg(test)]
pub(crate) fn test_input(capacity: usize) -> (PipelineInput, mpsc::Receiver<(u64, AudioFrame)>) {
    let (tx, rx) = mpsc::channel(capacity);
    let input = PipelineInput {
        tx,
        epoch: 0,
        token: CancellationToken::new(),
    };
    (input, rx)
}

fn next_item(item: &watch::Sender<ItemSlot>) {
    item.send_modify(|(epoch, token)| {
        token.cancel();
        *epoch += 1;
        *token = CancellationToken::new();
    });
}

pub struct AudioPipeline {
    settings: PipelineSettings,
    sender: VoiceSender,
    encoder: OpusEncoder,
    pacer: Pacer,
    input: mpsc::Receiver<(u64, AudioFrame)>,
    lookahead: Option<(u64, AudioFrame)>,
    control: mpsc::UnboundedReceiver<Control>,
    item: Arc<watch::Sender<ItemSlot>>,
    state: watch::Sender<PipelineState>,
    stats: watch::Sender<PipelineStats>,
    speaking: watch::Sender<bool>,
    completions: broadcast::Sender<Completion>,
    cancel: CancellationToken,
    idle: u32,
    in_item: bool,
    discarding: bool,
    item_user: Option<Snowflake>,
}

impl AudioPipeline {
    /// Start the loop in the Stopped state. The returned receiver reports
    /// whether we should be flagged as speaking.
    pub fn spawn(
        sender: VoiceSender,
        settings: PipelineSettings,
    ) -> Result<(PipelineHandle, watch::Receiver<bool>), OpusError> {
        let encoder = OpusEncoder::new()?;
        let (input_tx, input_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let item = Arc::new(watch::Sender::new((0, CancellationToken::new())));
        let (state_tx, state_rx) = watch::channel(PipelineState::Stopped);
        let (stats_tx, stats_rx) = watch::channel(PipelineStats::default());
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = PipelineHandle {
            input: input_tx,
            control: control_tx,
            item: Arc::clone(&item),
            state: state_rx,
            stats: stats_rx,
            completions: completions.clone(),
            cancel: cancel.clone(),
        };
        let pipeline = Self {
            pacer: Pacer::new(settings.period, settings.spin_window),
            settings,
            sender,
            encoder,
            input: input_rx,
            lookahead: None,
            control: control_rx,
            item,
            state: state_tx,
            stats: stats_tx,
            speaking: speaking_tx,
            completions,
            cancel,
            idle: 0,
            in_item: false,
            discarding: false,
            item_user: None,
        };
        tokio::spawn(pipeline.run());
        Ok((handle, speaking_rx))
    }

    async fn run(mut self) {
        tracing::debug!(ssrc = self.sender.ssrc(), "audio pipeline started");
        let mut keepalive_at = Instant::now() + self.settings.keepalive_interval;

        loop {
            if self.current_state() == PipelineState::Playing {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    control = self.control.recv() => match control {
                        Some(control) => self.on_control(control),
                        None => break,
                    },
                    _ = self.pacer.wait() => {
                        self.pacer.tick();
                        let started = Instant::now();
                        self.tick();
                        self.pacer.record_cost(started.elapsed());
                        self.publish_stats();
                    }
                }
                keepalive_at = Instant::now() + self.settings.keepalive_interval;
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    control = self.control.recv() => match control {
                        Some(control) => self.on_control(control),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(keepalive_at) => {
                        self.send_silence();
                        self.publish_stats();
                        keepalive_at = Instant::now() + self.settings.keepalive_interval;
                    }
                }
            }
        }

        if self.current_state() == PipelineState::Playing {
            self.leave_playing(PipelineState::Stopped);
        }
        next_item(&self.item);
        self.cancel.cancel();
        tracing::debug!(ssrc = self.sender.ssrc(), "audio pipeline stopped");
    }

    fn current_state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn on_control(&mut self, control: Control) {
        let state = self.current_state();
        match control {
            Control::Play => {
                if state != PipelineState::Playing {
                    self.enter_playing();
                }
            }
            Control::Resume => {
                if state == PipelineState::Paused {
                    self.enter_playing();
                }
            }
            Control::Pause => {
                if state == PipelineState::Playing {
                    self.leave_playing(PipelineState::Paused);
                }
            }
            Control::Stop => {
                let drained = self.drain_stale();
                if self.in_item || drained > 0 {
                    self.complete(ItemOutcome::Cancelled);
                }
                self.end_item();
                if state == PipelineState::Playing {
                    self.leave_playing(PipelineState::Stopped);
                } else {
                    self.state.send_replace(PipelineState::Stopped);
                }
            }
            Control::Skip => {
                let drained = self.drain_stale();
                if self.in_item || drained > 0 {
                    self.complete(ItemOutcome::Finished);
                }
                self.end_item();
            }
            Control::Rebind(sender) => {
                tracing::info!(old_ssrc = self.sender.ssrc(), new_ssrc = sender.ssrc(), "audio pipeline rebound");
                self.sender = *sender;
            }
        }
    }

    fn enter_playing(&mut self) {
        self.pacer.reanchor();
        self.idle = 0;
        self.state.send_replace(PipelineState::Playing);
        self.speaking.send_replace(true);
        tracing::debug!(ssrc = self.sender.ssrc(), "audio pipeline playing");
    }

    fn leave_playing(&mut self, next: PipelineState) {
        self.send_silence();
        self.speaking.send_replace(false);
        self.state.send_replace(next);
        tracing::debug!(ssrc = self.sender.ssrc(), state = ?next, "audio pipeline left playing");
    }

    fn send_silence(&mut self) {
        if let Err(e) = self.sender.send_silence(SILENCE_BURST) {
            tracing::debug!(error = %e, "silence burst not sent");
        }
    }

    fn tick(&mut self) {
        let Some(frame) = self.next_frame() else {
            self.on_idle();
            return;
        };
        self.idle = 0;
        if frame.user_id.is_some() {
            self.item_user = frame.user_id;
        }

        match frame.tag {
            FrameTag::Skip => {
                if !self.discarding {
                    self.complete(ItemOutcome::Finished);
                }
                self.end_item();
            }
            FrameTag::Cancel => {
                if !self.discarding {
                    self.complete(ItemOutcome::Cancelled);
                }
                self.end_item();
            }
            FrameTag::Normal if self.discarding => {}
            FrameTag::Normal => {
                self.in_item = true;
                if let Err(reason) = self.transmit(&frame) {
                    tracing::warn!(%reason, "audio item failed");
                    self.complete(ItemOutcome::Failed(reason));
                    self.in_item = false;
                    self.discarding = true;
                }
            }
        }
    }

    fn transmit(&mut self, frame: &AudioFrame) -> Result<(), String> {
        let encoded;
        let opus: &[u8] = match &frame.payload {
            FramePayload::Pcm(pcm) => {
                encoded = self.encoder.encode(pcm).map_err(|e| e.to_string())?;
                &encoded
            }
            FramePayload::Opus(data) => data,
            FramePayload::Empty => return Ok(()),
        };

        match self.sender.send_opus(opus, frame.sample_count) {
            Ok(()) => Ok(()),
            Err(TransportError::Crypto(e)) => Err(e.to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "voice send failed, frame lost");
                Ok(())
            }
        }
    }

    fn on_idle(&mut self) {
        self.idle += 1;
        if self.idle < self.settings.idle_ticks {
            return;
        }
        self.idle = 0;
        tracing::warn!(
            ticks = self.settings.idle_ticks,
            in_item = self.in_item,
            "audio source idle"
        );
        self.complete(ItemOutcome::Failed("source idle".into()));
        next_item(&self.item);
        self.end_item();
        self.leave_playing(PipelineState::Stopped);
    }

    fn current_epoch(&self) -> u64 {
        self.item.borrow().0
    }

    /// Next frame of the current item, dropping stale ones.
    fn next_frame(&mut self) -> Option<AudioFrame> {
        let current = self.current_epoch();
        loop {
            let (epoch, frame) = match self.lookahead.take() {
                Some(queued) => queued,
                None => self.input.try_recv().ok()?,
            };
            if epoch == current {
                return Some(frame);
            }
        }
    }

    /// Discard frames from earlier generations. Stops at the first frame of
    /// the current one, which stays queued.
    fn drain_stale(&mut self) -> usize {
        let current = self.current_epoch();
        let mut drained = 0;
        loop {
            let queued = match self.lookahead.take() {
                Some(queued) => queued,
                None => match self.input.try_recv() {
                    Ok(queued) => queued,
                    Err(_) => break,
                },
            };
            if queued.0 >= current {
                self.lookahead = Some(queued);
                break;
            }
            drained += 1;
        }
        drained
    }

    fn complete(&mut self, outcome: ItemOutcome) {
        tracing::debug!(?outcome, user_id = ?self.item_user, "audio item complete");
        let _ = self.completions.send(Completion {
            outcome,
            user_id: self.item_user,
        });
    }

    fn end_item(&mut self) {
        self.in_item = false;
        self.discarding = false;
        self.item_user = None;
    }

    fn publish_stats(&self) {
        self.stats.send_replace(PipelineStats {
            pacer: self.pacer.stats(),
            send: self.sender.stats(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_codec::audio::opus::FRAME_SAMPLES;
    use cadence_codec::{EncryptionMode, PacketSealer};
    use cadence_transport::{open_packet, RtpContext};
    use tokio::net::UdpSocket;

    const KEY: [u8; 32] = [5u8; 32];

    struct Harness {
        handle: PipelineHandle,
        speaking: watch::Receiver<bool>,
        completions: broadcast::Receiver<Completion>,
        server: UdpSocket,
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            spin_window: Duration::ZERO,
            idle_ticks: 10,
            ..PipelineSettings::default()
        }
    }

    async fn sender(server: &UdpSocket, ssrc: u32) -> VoiceSender {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server.local_addr().unwrap()).await.unwrap();
        VoiceSender::new(
            Arc::new(socket),
            PacketSealer::new(EncryptionMode::Lite, &KEY).unwrap(),
            RtpContext::starting_at(ssrc, 1000, 0),
        )
    }

    async fn harness(settings: PipelineSettings) -> Harness {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = sender(&server, 77).await;
        let (handle, speaking) = AudioPipeline::spawn(sender, settings).unwrap();
        let completions = handle.subscribe();
        Harness {
            handle,
            speaking,
            completions,
            server,
        }
    }

    async fn recv_packet(server: &UdpSocket) -> cadence_transport::InboundPacket {
        let opener = PacketSealer::new(EncryptionMode::Lite, &KEY).unwrap();
        let mut buf = [0u8; 1500];
        let n = tokio::time::timeout(Duration::from_secs(2), server.recv(&mut buf))
            .await
            .expect("no packet")
            .unwrap();
        open_packet(&opener, &buf[..n]).unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn plays_item_and_reports_finished() {
        let mut h = harness(settings()).await;
        let input = h.handle.input();
        for i in 0..3u8 {
            input.send(AudioFrame::opus(vec![0xFC, i])).await;
        }
        input.send(AudioFrame::skip().with_user(Some(Snowflake(9)))).await;
        h.handle.play();

        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.outcome, ItemOutcome::Finished);
        assert_eq!(completion.user_id, Some(Snowflake(9)));
        assert!(*h.speaking.borrow());
        assert_eq!(h.handle.state(), PipelineState::Playing);

        for i in 0..3u16 {
            let packet = recv_packet(&h.server).await;
            assert_eq!(packet.sequence, 1000 + i);
            assert_eq!(packet.timestamp, 960 * i as u32);
            assert_eq!(packet.opus, vec![0xFC, i as u8]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn encodes_pcm_frames() {
        let mut h = harness(settings()).await;
        let input = h.handle.input();
        input.send(AudioFrame::pcm(vec![0i16; FRAME_SAMPLES])).await;
        input.send(AudioFrame::skip()).await;
        h.handle.play();
        assert_eq!(h.completions.recv().await.unwrap().outcome, ItemOutcome::Finished);
        let packet = recv_packet(&h.server).await;
        assert!(!packet.opus.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn encode_failure_fails_only_the_item() {
        let mut h = harness(settings()).await;
        let input = h.handle.input();
        input.send(AudioFrame::pcm(vec![0i16; 10])).await;
        input.send(AudioFrame::opus(vec![0xFC, 0xAA])).await;
        input.send(AudioFrame::skip()).await;
        input.send(AudioFrame::opus(vec![0xFC, 0xBB])).await;
        input.send(AudioFrame::skip()).await;
        h.handle.play();

        let first = h.completions.recv().await.unwrap();
        assert!(matches!(first.outcome, ItemOutcome::Failed(_)));
        let second = h.completions.recv().await.unwrap();
        assert_eq!(second.outcome, ItemOutcome::Finished);

        // The rest of the failed item never went out.
        let packet = recv_packet(&h.server).await;
        assert_eq!(packet.opus, vec![0xFC, 0xBB]);
        assert_eq!(packet.sequence, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_fails_and_stops() {
        let mut h = harness(settings()).await;
        let input = h.handle.input();
        input.send(AudioFrame::opus(vec![0xFC])).await;
        h.handle.play();

        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.outcome, ItemOutcome::Failed("source idle".into()));
        let mut state = h.handle.watch_state();
        state.wait_for(|s| *s == PipelineState::Stopped).await.unwrap();
        assert!(!*h.speaking.borrow());
        assert!(input.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn play_without_audio_fails_instead_of_waiting() {
        let mut h = harness(settings()).await;
        let started = Instant::now();
        h.handle.play();

        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.outcome, ItemOutcome::Failed("source idle".into()));
        assert_eq!(completion.user_id, None);
        assert!(started.elapsed() >= FRAME_PERIOD * 9);
        let mut state = h.handle.watch_state();
        state.wait_for(|s| *s == PipelineState::Stopped).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_and_drains() {
        let mut h = harness(PipelineSettings {
            idle_ticks: 1000,
            ..settings()
        })
        .await;
        let input = h.handle.input();
        input.send(AudioFrame::opus(vec![0xFC, 1])).await;
        h.handle.play();
        // First frame goes out, then the item is starved but still open.
        recv_packet(&h.server).await;
        for _ in 0..5 {
            input.send(AudioFrame::opus(vec![0xFC, 2])).await;
        }
        h.handle.stop();

        let completion = h.completions.recv().await.unwrap();
        assert_eq!(completion.outcome, ItemOutcome::Cancelled);
        assert!(!input.send(AudioFrame::opus(vec![0xFC, 3])).await);
        let mut state = h.handle.watch_state();
        state.wait_for(|s| *s == PipelineState::Stopped).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn skip_keeps_playing_next_item() {
        let mut h = harness(PipelineSettings {
            idle_ticks: 1000,
            ..settings()
        })
        .await;
        let first = h.handle.input();
        first.send(AudioFrame::opus(vec![0xFC, 1])).await;
        h.handle.play();
        recv_packet(&h.server).await;

        h.handle.skip();
        assert_eq!(h.completions.recv().await.unwrap().outcome, ItemOutcome::Finished);
        assert_eq!(h.handle.state(), PipelineState::Playing);

        let second = h.handle.input();
        assert!(first.is_cancelled());
        second.send(AudioFrame::opus(vec![0xFC, 2])).await;
        second.send(AudioFrame::skip()).await;
        assert_eq!(h.completions.recv().await.unwrap().outcome, ItemOutcome::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_keeps_rtp_state() {
        let mut h = harness(PipelineSettings {
            idle_ticks: 1000,
            ..settings()
        })
        .await;
        let input = h.handle.input();
        input.send(AudioFrame::opus(vec![0xFC, 1])).await;
        h.handle.play();
        assert_eq!(recv_packet(&h.server).await.sequence, 1000);

        h.handle.pause();
        let mut state = h.handle.watch_state();
        state.wait_for(|s| *s == PipelineState::Paused).await.unwrap();
        // Leaving playback flushes the silence burst.
        for i in 0..SILENCE_BURST as u16 {
            let packet = recv_packet(&h.server).await;
            assert_eq!(packet.sequence, 1001 + i);
        }

        input.send(AudioFrame::opus(vec![0xFC, 2])).await;
        input.send(AudioFrame::skip()).await;
        h.handle.resume();
        assert_eq!(h.completions.recv().await.unwrap().outcome, ItemOutcome::Finished);
        let packet = recv_packet(&h.server).await;
        assert_eq!(packet.sequence, 1001 + SILENCE_BURST as u16);
        assert_eq!(packet.opus, vec![0xFC, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_while_stopped() {
        let h = harness(settings()).await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        let packet = recv_packet(&h.server).await;
        assert_eq!(packet.opus, cadence_codec::audio::opus::SILENCE_FRAME);
        assert_eq!(h.handle.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn rebind_switches_ssrc() {
        let mut h = harness(PipelineSettings {
            idle_ticks: 1000,
            ..settings()
        })
        .await;
        let replacement = sender(&h.server, 88).await;
        h.handle.rebind(replacement);
        let input = h.handle.input();
        input.send(AudioFrame::opus(vec![0xFC])).await;
        input.send(AudioFrame::skip()).await;
        h.handle.play();
        h.completions.recv().await.unwrap();
        let packet = recv_packet(&h.server).await;
        assert_eq!(packet.ssrc, 88);
    }
}
