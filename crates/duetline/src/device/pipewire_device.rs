//! PipeWire duplex device
//!
//! One playback stream (F32LE, interleaved) and one capture stream (S16LE,
//! mono), each on its own thread running a PipeWire main loop:
//!
//! ```text
//! pipewire-output thread                pipewire-input thread
//!        │                                     │
//!   process callback                      process callback
//!        │                                     │
//!   RenderCallback(&mut [f32])            CaptureCallback(&[i16])
//!        │                                     │
//!   copy to PW buffer                     read from PW buffer
//! ```
//!
//! Scratch buffers are allocated before the streams connect so the process
//! callbacks never allocate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::{
    AudioDevice, CaptureCallback, DeviceError, DeviceStats, RenderCallback, StreamConfig,
};

/// Largest block PipeWire is expected to ask for in one callback.
const MAX_BLOCK_FRAMES: usize = 8192;

struct StreamThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("pipewire stream thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct PipeWireDevice {
    config: Option<StreamConfig>,
    output: Option<StreamThread>,
    input: Option<StreamThread>,
    stats: Arc<DeviceStats>,
}

impl PipeWireDevice {
    pub fn new() -> Self {
        Self {
            config: None,
            output: None,
            input: None,
            stats: Arc::new(DeviceStats::default()),
        }
    }

    fn spawn_stream<F>(name: &str, body: F) -> Result<StreamThread, DeviceError>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<(), DeviceError> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Err(e) = body(running_for_thread) {
                    error!(stream = %thread_name, error = %e, "pipewire stream failed");
                }
            })
            .map_err(|e| DeviceError::ThreadSpawn(e.to_string()))?;

        Ok(StreamThread {
            running,
            handle: Some(handle),
        })
    }
}

impl Default for PipeWireDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDevice for PipeWireDevice {
    fn name(&self) -> &str {
        "pipewire"
    }

    fn open(&mut self, config: &StreamConfig) -> Result<(), DeviceError> {
        pipewire::init();

        // probe the daemon so a missing server fails at open
        let mainloop = pipewire::main_loop::MainLoopRc::new(None)
            .map_err(|e| DeviceError::Unavailable(format!("main loop: {e}")))?;
        let context = pipewire::context::ContextRc::new(&mainloop, None)
            .map_err(|e| DeviceError::Unavailable(format!("context: {e}")))?;
        context
            .connect_rc(None)
            .map_err(|e| DeviceError::Unavailable(format!("connect: {e}")))?;

        info!(
            rate = config.sample_rate,
            frames = config.buffer_frames,
            latency_ms = config.latency_ms(),
            "pipewire session opened"
        );
        self.config = Some(config.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn start_output(&mut self, render: RenderCallback) -> Result<(), DeviceError> {
        self.stop_output();
        let config = self.config.clone().ok_or(DeviceError::NotOpen)?;
        let stats = Arc::clone(&self.stats);
        let thread = Self::spawn_stream("pipewire-output", move |running| {
            run_output_loop(config, render, running, stats)
        })?;
        self.output = Some(thread);
        Ok(())
    }

    fn stop_output(&mut self) {
        if let Some(mut thread) = self.output.take() {
            thread.stop();
        }
    }

    fn start_input(&mut self, capture: CaptureCallback) -> Result<(), DeviceError> {
        self.stop_input();
        let config = self.config.clone().ok_or(DeviceError::NotOpen)?;
        let stats = Arc::clone(&self.stats);
        let thread = Self::spawn_stream("pipewire-input", move |running| {
            run_input_loop(config, capture, running, stats)
        })?;
        self.input = Some(thread);
        Ok(())
    }

    fn stop_input(&mut self) {
        if let Some(mut thread) = self.input.take() {
            thread.stop();
        }
    }

    fn close(&mut self) {
        self.stop_output();
        self.stop_input();
        if self.config.take().is_some() {
            debug!("pipewire session closed");
        }
    }

    fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for PipeWireDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn format_pod(
    format: pipewire::spa::param::audio::AudioFormat,
    sample_rate: u32,
    channels: u32,
) -> Result<Vec<u8>, DeviceError> {
    use pipewire as pw;
    use pw::spa;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(format);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(channels);

    let mut position = [0u32; spa::param::audio::MAX_CHANNELS];
    if channels == 1 {
        position[0] = pw::spa::sys::SPA_AUDIO_CHANNEL_MONO;
    } else {
        position[0] = pw::spa::sys::SPA_AUDIO_CHANNEL_FL;
        position[1] = pw::spa::sys::SPA_AUDIO_CHANNEL_FR;
    }
    audio_info.set_position(position);

    let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(pw::spa::pod::Object {
            type_: pw::spa::sys::SPA_TYPE_OBJECT_Format,
            id: pw::spa::sys::SPA_PARAM_EnumFormat,
            properties: audio_info.into(),
        }),
    )
    .map_err(|e| DeviceError::Stream(format!("failed to serialize format: {e}")))?
    .0
    .into_inner();

    Ok(values)
}

/// Quit the main loop once `running` drops, checked every 100 ms.
fn run_until_stopped(
    mainloop: &pipewire::main_loop::MainLoopRc,
    running: Arc<AtomicBool>,
) -> Result<(), DeviceError> {
    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if !running.load(Ordering::Acquire) {
            if let Some(ml) = mainloop_weak.upgrade() {
                ml.quit();
            }
        }
    });

    timer
        .update_timer(
            Some(std::time::Duration::from_millis(100)),
            Some(std::time::Duration::from_millis(100)),
        )
        .into_result()
        .map_err(|e| DeviceError::Stream(format!("failed to set timer: {e}")))?;

    mainloop.run();
    Ok(())
}

fn run_output_loop(
    config: StreamConfig,
    mut render: RenderCallback,
    running: Arc<AtomicBool>,
    stats: Arc<DeviceStats>,
) -> Result<(), DeviceError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| DeviceError::Unavailable(format!("main loop: {e}")))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| DeviceError::Unavailable(format!("context: {e}")))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| DeviceError::Unavailable(format!("connect: {e}")))?;

    let channels = config.output_channels as usize;
    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::AUDIO_CHANNELS => channels.to_string(),
    };
    let latency = format!("{}/{}", config.buffer_frames, config.sample_rate);
    props.insert("node.latency", latency.as_str());

    let stream = pw::stream::StreamBox::new(&core, &format!("{}-playback", config.name), props)
        .map_err(|e| DeviceError::Stream(format!("failed to create stream: {e}")))?;

    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * channels;
    let target_frames = config.buffer_frames;
    let block = vec![0.0f32; MAX_BLOCK_FRAMES * channels];

    let _listener = stream
        .add_local_listener_with_user_data((stats, block))
        .process(move |stream, (stats, block)| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let requested = buffer.requested() as usize;
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let Some(slice) = data.data() else {
                return;
            };

            let max_frames = (slice.len() / stride).min(MAX_BLOCK_FRAMES);
            let n_frames = if requested > 0 {
                target_frames.min(requested).min(max_frames)
            } else {
                target_frames.min(max_frames)
            };
            let out = &mut block[..n_frames * channels];

            render(out);
            stats.record_output(out, channels);

            for (i, sample) in out.iter().enumerate() {
                let start = i * sample_size;
                slice[start..start + sample_size].copy_from_slice(&sample.to_le_bytes());
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (stride * n_frames) as u32;
        })
        .register()
        .map_err(|e| DeviceError::Stream(format!("failed to register listener: {e}")))?;

    let values = format_pod(
        spa::param::audio::AudioFormat::F32LE,
        config.sample_rate,
        channels as u32,
    )?;
    let mut params = [Pod::from_bytes(&values)
        .ok_or_else(|| DeviceError::Stream("failed to create Pod from bytes".to_string()))?];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| DeviceError::Stream(format!("failed to connect stream: {e}")))?;

    debug!("pipewire playback stream connected");
    run_until_stopped(&mainloop, running)?;
    debug!("pipewire playback loop exited");
    Ok(())
}

fn run_input_loop(
    config: StreamConfig,
    mut capture: CaptureCallback,
    running: Arc<AtomicBool>,
    stats: Arc<DeviceStats>,
) -> Result<(), DeviceError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| DeviceError::Unavailable(format!("main loop: {e}")))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| DeviceError::Unavailable(format!("context: {e}")))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| DeviceError::Unavailable(format!("connect: {e}")))?;

    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Production",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::AUDIO_CHANNELS => "1",
    };
    let latency = format!("{}/{}", config.buffer_frames, config.sample_rate);
    props.insert("node.latency", latency.as_str());

    let stream = pw::stream::StreamBox::new(&core, &format!("{}-capture", config.name), props)
        .map_err(|e| DeviceError::Stream(format!("failed to create stream: {e}")))?;

    let sample_size = std::mem::size_of::<i16>();
    let block = vec![0i16; MAX_BLOCK_FRAMES];

    let _listener = stream
        .add_local_listener_with_user_data((stats, block))
        .process(move |stream, (stats, block)| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let size = data.chunk().size() as usize;
            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = (size.min(slice.len()) / sample_size).min(MAX_BLOCK_FRAMES);
            if n_frames == 0 {
                return;
            }

            for (i, sample) in block[..n_frames].iter_mut().enumerate() {
                let at = i * sample_size;
                *sample = i16::from_le_bytes([slice[at], slice[at + 1]]);
            }

            capture(&block[..n_frames]);
            stats.record_input(n_frames);
        })
        .register()
        .map_err(|e| DeviceError::Stream(format!("failed to register listener: {e}")))?;

    let values = format_pod(spa::param::audio::AudioFormat::S16LE, config.sample_rate, 1)?;
    let mut params = [Pod::from_bytes(&values)
        .ok_or_else(|| DeviceError::Stream("failed to create Pod from bytes".to_string()))?];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| DeviceError::Stream(format!("failed to connect stream: {e}")))?;

    debug!("pipewire capture stream connected");
    run_until_stopped(&mainloop, running)?;
    debug!("pipewire capture loop exited");
    Ok(())
}
