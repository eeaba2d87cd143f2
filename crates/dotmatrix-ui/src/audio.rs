use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use dotmatrix_core::machine::Machine;

/// Start audio playback with `cpal`, pulling frames from the core's PCM
/// ring. Returns the active stream, which must be kept alive.
pub fn start_stream(machine: &mut Machine) -> Option<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_output_device()?;
    let supported = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            log::warn!("no supported audio output config: {e}");
            return None;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    machine.set_sample_rate(config.sample_rate.0);
    let rx = machine.audio_output()?;
    let channels = config.channels as usize;
    let err_fn = |err| log::warn!("audio stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    for frame in data.chunks_mut(channels) {
                        let (left, right) = rx.pop().unwrap_or((0, 0));
                        frame[0] = left;
                        if channels > 1 {
                            frame[1] = right;
                        }
                    }
                },
                err_fn,
                None,
            )
            .ok()?,
        cpal::SampleFormat::F32 => device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    for frame in data.chunks_mut(channels) {
                        let (left, right) = rx.pop().unwrap_or((0, 0));
                        frame[0] = f32::from(left) / 32768.0;
                        if channels > 1 {
                            frame[1] = f32::from(right) / 32768.0;
                        }
                    }
                },
                err_fn,
                None,
            )
            .ok()?,
        other => {
            log::warn!("unsupported audio sample format {other:?}");
            return None;
        }
    };

    if let Err(e) = stream.play() {
        log::warn!("failed to start audio stream: {e}");
        return None;
    }
    Some(stream)
}
