//! ffprobe/ffmpeg subprocess backend
//!
//! Frames come out of ffmpeg as raw RGB24 on stdout, one `width * height * 3`
//! block per decoded frame, so selecting frames is just counting blocks.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread;

use super::{Frame, VideoDecoder, VideoInfo};

/// Lines of ffmpeg stderr kept for error messages
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
    nb_read_packets: Option<String>,
}

/// Decoder that shells out to the ffmpeg CLI tools
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg: String,
    ffprobe: String,
    threads: usize,
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe", 1)
    }
}

impl FfmpegDecoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, threads: usize) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            threads: threads.max(1),
        }
    }

    fn run_probe(&self, path: &Path, extra: &[&str], entries: &str) -> Result<ProbeStream> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(extra)
            .args(["-show_entries", entries, "-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("failed to run {}", self.ffprobe))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("ffprobe failed: {}", stderr.trim());
        }

        parse_probe(&output.stdout)
    }

    /// Demux the whole stream to count packets, for containers that don't
    /// record a frame count in their header
    fn count_frames(&self, path: &Path) -> Result<usize> {
        let stream = self.run_probe(path, &["-count_packets"], "stream=nb_read_packets")?;
        parse_count(stream.nb_read_packets.as_deref())
            .ok_or_else(|| anyhow!("could not determine frame count"))
    }
}

fn parse_probe(stdout: &[u8]) -> Result<ProbeStream> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).context("unreadable ffprobe output")?;
    probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no video stream found"))
}

/// ffprobe reports counts as strings, "N/A" when unknown
fn parse_count(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
}

/// Map each wanted frame index to the output positions that need it
fn wanted_positions(indices: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut wanted: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (pos, &index) in indices.iter().enumerate() {
        wanted.entry(index).or_default().push(pos);
    }
    wanted
}

/// Read raw frames up to and including `last`, filling one slot per
/// requested position. Returns the slots and how many frames were decoded.
fn collect_frames(
    stdout: ChildStdout,
    info: &VideoInfo,
    wanted: &BTreeMap<usize, Vec<usize>>,
    slot_count: usize,
    last: usize,
) -> Result<(Vec<Option<Frame>>, usize)> {
    let frame_size = info.frame_size();
    let mut reader = BufReader::with_capacity(frame_size, stdout);

    let mut slots: Vec<Option<Frame>> = vec![None; slot_count];
    let mut buf = vec![0u8; frame_size];
    let mut decoded = 0usize;

    while decoded <= last {
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("failed reading ffmpeg output"),
        }

        if let Some(positions) = wanted.get(&decoded) {
            let frame = Frame {
                rgb: buf.clone(),
                width: info.width,
                height: info.height,
            };
            for &pos in positions {
                slots[pos] = Some(frame.clone());
            }
        }
        decoded += 1;
    }

    // anything past the last wanted frame is discarded so ffmpeg never
    // sees a closed pipe
    io::copy(&mut reader, &mut io::sink()).context("failed reading ffmpeg output")?;
    Ok((slots, decoded))
}

/// Consume stderr to EOF, keeping only the last `keep` lines
fn stderr_tail(stderr: ChildStderr, keep: usize) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(keep);
    for line in BufReader::new(stderr).split(b'\n') {
        let Ok(line) = line else { break };
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(String::from_utf8_lossy(&line).trim_end().to_string());
    }
    Vec::from(tail).join("\n")
}

impl VideoDecoder for FfmpegDecoder {
    fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let stream = self.run_probe(path, &[], "stream=width,height,nb_frames")?;

        let (width, height) = match (stream.width, stream.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => bail!("video stream has no dimensions"),
        };

        let frame_count = match parse_count(stream.nb_frames.as_deref()) {
            Some(n) => n,
            None => {
                tracing::debug!(path = %path.display(), "nb_frames missing, counting packets");
                self.count_frames(path)?
            }
        };

        Ok(VideoInfo {
            width,
            height,
            frame_count,
        })
    }

    fn read_frames(&self, path: &Path, info: &VideoInfo, indices: &[usize]) -> Result<Vec<Frame>> {
        let wanted = wanted_positions(indices);
        let Some((&last, _)) = wanted.last_key_value() else {
            return Ok(vec![]);
        };

        let frame_size = info.frame_size();
        if frame_size == 0 {
            bail!("video stream has no dimensions");
        }

        let threads = self.threads.to_string();
        let frame_limit = (last + 1).to_string();
        let mut child = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin"])
            .args(["-threads", &threads])
            .arg("-noautorotate")
            .arg("-i")
            .arg(path)
            .args(["-map", "0:v:0", "-an", "-sn"])
            .args(["-vsync", "passthrough"])
            .args(["-frames:v", &frame_limit])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {}", self.ffmpeg))?;

        // ffmpeg can log far more than a pipe holds on a damaged stream, so
        // stderr is drained on its own thread while frames are read
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr unavailable"))?;
        let stderr_reader = thread::spawn(move || stderr_tail(stderr, STDERR_TAIL_LINES));

        let collected = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout unavailable"))
            .and_then(|stdout| collect_frames(stdout, info, &wanted, indices.len(), last));
        let (slots, decoded) = match collected {
            Ok(collected) => collected,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_reader.join();
                return Err(e);
            }
        };

        let status = child.wait().context("ffmpeg did not exit")?;
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            bail!("ffmpeg failed ({status}): {}", stderr.trim());
        }

        if decoded <= last {
            bail!(
                "video ended after {} frames but frame {} was requested (container reported {})",
                decoded,
                last,
                info.frame_count
            );
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| anyhow!("frame missing from decoder output")))
            .collect()
    }
}
