use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};
use tokio::time::Instant;
use tracing::debug;

use super::PipelineConfig;
use crate::process::{ProcessHandle, DEFAULT_TERMINATE_GRACE};

/// Where PCM comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// Decode `stream_url` with an ffmpeg child
    #[default]
    Ffmpeg,
    /// Synthetic sine tone paced in real time
    Tone {
        #[serde(default = "default_tone_hz")]
        frequency_hz: f32,
        /// Session ends (EOF) after this many seconds
        #[serde(default)]
        duration_secs: Option<f64>,
    },
}

fn default_tone_hz() -> f32 {
    440.0
}

/// One connection to the source, producing s16le mono PCM
pub(crate) enum StreamSession {
    Ffmpeg {
        stdout: ChildStdout,
        process: ProcessHandle,
    },
    Tone(ToneGenerator),
}

impl StreamSession {
    pub(crate) fn open(config: &PipelineConfig) -> io::Result<Self> {
        match &config.source {
            SourceKind::Ffmpeg => {
                let mut child = ffmpeg_command(config).spawn()?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdout not captured")
                })?;
                let process = ProcessHandle::watch("ffmpeg", child);
                debug!("ffmpeg started (pid {:?})", process.pid());
                Ok(StreamSession::Ffmpeg { stdout, process })
            }
            SourceKind::Tone {
                frequency_hz,
                duration_secs,
            } => {
                let limit = duration_secs
                    .map(Duration::try_from_secs_f64)
                    .transpose()
                    .map_err(|e| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("tone duration {:?}: {}", duration_secs, e),
                        )
                    })?;
                Ok(StreamSession::Tone(ToneGenerator::new(
                    *frequency_hz,
                    config.sample_rate,
                    limit,
                )))
            }
        }
    }

    /// Fill `buf` as far as the source allows. `Ok(0)` means end of stream.
    pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSession::Ffmpeg { stdout, .. } => {
                let mut filled = 0;
                while filled < buf.len() {
                    let n = stdout.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                Ok(filled)
            }
            StreamSession::Tone(tone) => tone.read_chunk(buf).await,
        }
    }

    pub(crate) async fn close(self) {
        if let StreamSession::Ffmpeg { stdout, mut process } = self {
            drop(stdout);
            process.terminate(DEFAULT_TERMINATE_GRACE).await;
        }
    }
}

pub(crate) fn ffmpeg_command(config: &PipelineConfig) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error"])
        .args(["-reconnect", "1", "-reconnect_streamed", "1"])
        .arg("-reconnect_delay_max")
        .arg(config.max_reconnect_delay.as_secs().to_string())
        .arg("-i")
        .arg(&config.stream_url)
        .args(["-f", "s16le", "-acodec", "pcm_s16le"])
        .arg("-ar")
        .arg(config.sample_rate.to_string())
        .args(["-ac", "1", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Sine generator delivering samples no faster than real time
pub(crate) struct ToneGenerator {
    frequency_hz: f32,
    sample_rate: u32,
    limit: Option<Duration>,
    phase: f32,
    samples_emitted: u64,
    started: Instant,
}

impl ToneGenerator {
    fn new(frequency_hz: f32, sample_rate: u32, limit: Option<Duration>) -> Self {
        Self {
            frequency_hz,
            sample_rate,
            limit,
            phase: 0.0,
            samples_emitted: 0,
            started: Instant::now(),
        }
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let emitted = Duration::from_secs_f64(self.samples_emitted as f64 / self.sample_rate as f64);
        if self.limit.is_some_and(|limit| emitted >= limit) {
            return Ok(0);
        }

        tokio::time::sleep_until(self.started + emitted).await;

        let step = TAU * self.frequency_hz / self.sample_rate as f32;
        let mut written = 0;
        for frame in buf.chunks_exact_mut(2) {
            let sample = (self.phase.sin() * 0.5 * i16::MAX as f32) as i16;
            frame.copy_from_slice(&sample.to_le_bytes());
            self.phase = (self.phase + step) % TAU;
            written += 2;
        }
        self.samples_emitted += (written / 2) as u64;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm_levels;

    fn tone_config(duration_secs: Option<f64>) -> PipelineConfig {
        PipelineConfig {
            stream_url: "tone://test".into(),
            frequency: 88.1,
            sample_rate: 8000,
            chunk_size: 800,
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            source: SourceKind::Tone {
                frequency_hz: 440.0,
                duration_secs,
            },
        }
    }

    #[test]
    fn test_ffmpeg_arguments() {
        let mut config = tone_config(None);
        config.source = SourceKind::Ffmpeg;
        config.stream_url = "http://icecast.local:8000/powerfm".into();
        config.sample_rate = 48_000;
        config.max_reconnect_delay = Duration::from_secs(60);

        let cmd = ffmpeg_command(&config);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.contains("-reconnect_delay_max 60"));
        assert!(joined.contains("-i http://icecast.local:8000/powerfm"));
        assert!(joined.contains("-f s16le -acodec pcm_s16le -ar 48000 -ac 1 -"));
    }

    #[test]
    fn test_source_kind_json() {
        let kind: SourceKind = serde_json::from_str(r#"{"type": "tone"}"#).unwrap();
        assert_eq!(
            kind,
            SourceKind::Tone {
                frequency_hz: 440.0,
                duration_secs: None
            }
        );
        let kind: SourceKind = serde_json::from_str(r#"{"type": "ffmpeg"}"#).unwrap();
        assert_eq!(kind, SourceKind::Ffmpeg);
    }

    #[tokio::test]
    async fn test_tone_session_ends_after_duration() {
        let mut session = StreamSession::open(&tone_config(Some(0.2))).unwrap();
        let mut buf = vec![0u8; 800];
        let mut chunks = 0;
        loop {
            let n = session.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(n, 800);
            let levels = pcm_levels(&buf[..n]).unwrap();
            assert!(levels.peak > 0.4 && levels.peak <= 0.5);
            chunks += 1;
        }
        // 0.2 s at 8 kHz = 1600 samples = 4 chunks of 400 samples
        assert_eq!(chunks, 4);
        session.close().await;
    }

    #[test]
    fn test_invalid_tone_duration_is_an_error() {
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = StreamSession::open(&tone_config(Some(bad))).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
    }
}
