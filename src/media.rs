use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use cpal::Sample as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};

const CAPTURE_POLL: Duration = Duration::from_millis(50);

/// The local audio+video stream shared read-only by every peer connection.
///
/// Acquired at most once per session. Track handles are reference-counted,
/// so each peer connection wraps the same tracks; disabling a track gates
/// the writer side, peers simply stop receiving frames.
#[derive(Clone)]
pub struct LocalStream {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalStream {
    pub fn new() -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "peermesh".to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "peermesh".to_owned(),
        ));
        Self {
            audio,
            video,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.video.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Stops capture feeding this stream. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquires the local media stream. Failure is fatal for the session.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream>;
}

/// Microphone capture via the default cpal input device.
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread that
/// polls the stream's stop flag. Frames for the video track are written by
/// the embedding application through [`LocalStream::video_track`].
pub struct DeviceCapture;

#[async_trait]
impl MediaCapture for DeviceCapture {
    async fn acquire(&self) -> Result<LocalStream> {
        let stream = LocalStream::new();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let thread_stream = stream.clone();
        std::thread::Builder::new()
            .name("peermesh-capture".to_string())
            .spawn(move || match open_input(&thread_stream) {
                Ok(input) => {
                    let _ = ready_tx.send(Ok(()));
                    while !thread_stream.is_stopped() {
                        std::thread::sleep(CAPTURE_POLL);
                    }
                    drop(input);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::Media(format!("failed to spawn capture thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| Error::Media("capture thread exited before reporting".to_string()))??;
        Ok(stream)
    }
}

fn open_input(stream: &LocalStream) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Media("no input device available".to_string()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::Media(format!("no default input config: {}", e)))?;
    debug!("input config: {:?}", config);

    let format = config.sample_format();
    let config: cpal::StreamConfig = config.into();
    let input = match format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, stream.clone())?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, stream.clone())?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, stream.clone())?,
        other => {
            return Err(Error::Media(format!("unsupported sample format: {:?}", other)));
        }
    };

    input
        .play()
        .map_err(|e| Error::Media(format!("failed to start input stream: {}", e)))?;
    Ok(input)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    stream: LocalStream,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0 as f64;
    let track = stream.audio_track();

    let err_fn = |err| warn!("input audio stream error: {}", err);

    let input = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !stream.audio_enabled() || stream.is_stopped() {
                    return;
                }
                let mut pcm = Vec::with_capacity(data.len() * 4);
                for sample in data {
                    pcm.extend_from_slice(&f32::from_sample(*sample).to_le_bytes());
                }
                let frames = data.len() / channels.max(1);
                let sample = Sample {
                    data: Bytes::from(pcm),
                    duration: Duration::from_secs_f64(frames as f64 / sample_rate),
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    debug!("failed to write audio sample: {}", e);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Media(format!("failed to build input stream: {}", e)))?;

    Ok(input)
}

/// Capture backend with no device: the stream's tracks are created but only
/// written if the embedding application feeds them. Used for headless runs
/// and tests.
pub struct NullCapture;

#[async_trait]
impl MediaCapture for NullCapture {
    async fn acquire(&self) -> Result<LocalStream> {
        Ok(LocalStream::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_is_idempotent() {
        let stream = LocalStream::new();
        assert!(stream.audio_enabled());
        stream.set_audio_enabled(true);
        stream.set_audio_enabled(true);
        assert!(stream.audio_enabled());
        stream.set_audio_enabled(false);
        stream.set_audio_enabled(false);
        assert!(!stream.audio_enabled());
        assert!(stream.video_enabled());
    }

    #[test]
    fn stop_is_idempotent() {
        let stream = LocalStream::new();
        assert!(!stream.is_stopped());
        stream.stop();
        stream.stop();
        assert!(stream.is_stopped());
    }

    #[tokio::test]
    async fn null_capture_yields_a_live_stream() {
        let stream = NullCapture.acquire().await.unwrap();
        assert!(!stream.is_stopped());
        assert!(stream.audio_enabled());
    }
}
