//! Transcoder argument vectors
//!
//! Maps camera and recording parameters onto the transcoder's command-line
//! vocabulary. The output destination is not included; `ProcessTransport`
//! appends it.

use crate::config::CameraConfig;
use crate::recording::RecordingConfiguration;

/// Fragmentation flags for a self-initializing fragmented MP4 stream.
pub const FRAGMENTED_MOVFLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

fn log_args(debug: bool) -> [String; 3] {
    [
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        if debug { "verbose" } else { "error" }.to_string(),
    ]
}

/// Input tokens for reading a pre-record buffer replay at `address`.
pub fn replay_input_args(address: &str) -> Vec<String> {
    vec!["-f".to_string(), "mp4".to_string(), "-i".to_string(), address.to_string()]
}

/// Builds arguments for a recording session.
///
/// `input` is either the camera's own source tokens or a replay input. When
/// the camera's audio is disabled a silent track is synthesized so the
/// container always carries an audio stream.
pub fn build_recording_args(
    camera: &CameraConfig,
    input: &[String],
    recording: &RecordingConfiguration,
    debug: bool,
) -> Vec<String> {
    let video = &recording.video;
    let audio = &recording.audio;
    let sample_rate = audio.sample_rate_hz();

    let mut args: Vec<String> = log_args(debug).into();
    args.extend(input.iter().cloned());

    if camera.audio_enabled {
        args.extend(["-map".to_string(), "0:v:0".to_string()]);
        args.extend(["-map".to_string(), "0:a:0?".to_string()]);
    } else {
        let layout = if audio.channels > 1 { "stereo" } else { "mono" };
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            format!("anullsrc=channel_layout={layout}:sample_rate={sample_rate}"),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-shortest".to_string(),
        ]);
    }

    // Video encoding
    let keyframe_seconds = f64::from(video.iframe_interval_ms) / 1000.0;
    args.extend([
        "-vcodec".to_string(),
        camera.video_codec().to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-profile:v".to_string(),
        video.profile.as_arg().to_string(),
        "-level:v".to_string(),
        video.level.as_arg().to_string(),
        "-b:v".to_string(),
        format!("{}k", video.bitrate_kbps),
        "-maxrate".to_string(),
        format!("{}k", video.bitrate_kbps),
        "-bufsize".to_string(),
        format!("{}k", video.bitrate_kbps.saturating_mul(2)),
        "-r".to_string(),
        video.fps.to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", video.width, video.height),
        "-force_key_frames".to_string(),
        format!("expr:gte(t,n_forced*{keyframe_seconds})"),
    ]);

    // Audio encoding
    let (encoder, profile) = audio.codec.encoder_args();
    args.extend([
        "-acodec".to_string(),
        encoder.to_string(),
        "-profile:a".to_string(),
        profile.to_string(),
        "-ar".to_string(),
        sample_rate.to_string(),
        "-b:a".to_string(),
        format!("{}k", audio.bitrate_kbps),
        "-ac".to_string(),
        audio.channels.to_string(),
    ]);

    // Fragmented MP4 container
    args.extend([
        "-f".to_string(),
        "mp4".to_string(),
        "-movflags".to_string(),
        FRAGMENTED_MOVFLAGS.to_string(),
        "-frag_duration".to_string(),
        recording.fragment_length_ms.saturating_mul(1000).to_string(),
        "-fflags".to_string(),
        "+genpts".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        "-max_muxing_queue_size".to_string(),
        "1024".to_string(),
    ]);

    args.extend(camera.extra_output_args.iter().cloned());
    args
}

/// Builds arguments for the pre-record buffer transcoder.
///
/// Video is copied without re-encoding; the recording session encodes.
pub fn build_prebuffer_args(camera: &CameraConfig, debug: bool) -> Vec<String> {
    let mut args: Vec<String> = log_args(debug).into();
    args.extend(camera.source_tokens());

    args.extend(["-map".to_string(), "0:v:0".to_string()]);
    if camera.audio_enabled {
        args.extend([
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-acodec".to_string(),
            "aac".to_string(),
        ]);
    } else {
        args.push("-an".to_string());
    }

    args.extend([
        "-vcodec".to_string(),
        "copy".to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        "-movflags".to_string(),
        FRAGMENTED_MOVFLAGS.to_string(),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{AudioCodec, H264Level, H264Profile};

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn camera(audio_enabled: bool) -> CameraConfig {
        CameraConfig {
            audio_enabled,
            ..CameraConfig::new("Porch", "-rtsp_transport tcp -i rtsp://porch/live")
        }
    }

    #[test]
    fn test_recording_args_map_codec_parameters() {
        let mut recording = RecordingConfiguration::default();
        recording.video.profile = H264Profile::High;
        recording.video.level = H264Level::Level3_1;
        recording.video.bitrate_kbps = 800;
        recording.video.width = 1280;
        recording.video.height = 720;
        recording.video.fps = 15;
        recording.audio.codec = AudioCodec::AacEld;
        recording.audio.sample_rate_khz = 16;

        let cam = camera(true);
        let args = build_recording_args(&cam, &cam.source_tokens(), &recording, false);

        assert_eq!(value_after(&args, "-profile:v"), Some("high"));
        assert_eq!(value_after(&args, "-level:v"), Some("3.1"));
        assert_eq!(value_after(&args, "-b:v"), Some("800k"));
        assert_eq!(value_after(&args, "-bufsize"), Some("1600k"));
        assert_eq!(value_after(&args, "-r"), Some("15"));
        assert_eq!(value_after(&args, "-vf"), Some("scale=1280:720"));
        assert_eq!(value_after(&args, "-acodec"), Some("libfdk_aac"));
        assert_eq!(value_after(&args, "-profile:a"), Some("aac_eld"));
        assert_eq!(value_after(&args, "-ar"), Some("16000"));
        assert_eq!(value_after(&args, "-movflags"), Some(FRAGMENTED_MOVFLAGS));
        assert_eq!(value_after(&args, "-loglevel"), Some("error"));
    }

    #[test]
    fn test_input_tokens_come_first() {
        let cam = camera(true);
        let args = build_recording_args(
            &cam,
            &cam.source_tokens(),
            &RecordingConfiguration::default(),
            true,
        );

        assert_eq!(
            &args[3..7],
            &["-rtsp_transport", "tcp", "-i", "rtsp://porch/live"]
        );
        assert_eq!(value_after(&args, "-loglevel"), Some("verbose"));
    }

    #[test]
    fn test_silent_audio_when_audio_disabled() {
        let cam = camera(false);
        let args = build_recording_args(
            &cam,
            &cam.source_tokens(),
            &RecordingConfiguration::default(),
            false,
        );

        assert!(args.iter().any(|a| a.starts_with("anullsrc=")));
        assert!(args.iter().any(|a| a == "1:a:0"));
        assert!(args.iter().any(|a| a == "-acodec"));
    }

    #[test]
    fn test_replay_input_replaces_camera_source() {
        let cam = camera(true);
        let input = replay_input_args("tcp://127.0.0.1:12345");
        let args = build_recording_args(&cam, &input, &RecordingConfiguration::default(), false);

        assert_eq!(value_after(&args, "-i"), Some("tcp://127.0.0.1:12345"));
        assert!(!args.iter().any(|a| a == "rtsp://porch/live"));
    }

    #[test]
    fn test_prebuffer_args_copy_video() {
        let args = build_prebuffer_args(&camera(false), false);

        assert_eq!(value_after(&args, "-vcodec"), Some("copy"));
        assert!(args.iter().any(|a| a == "-an"));
        assert_eq!(value_after(&args, "-movflags"), Some(FRAGMENTED_MOVFLAGS));
    }

    #[test]
    fn test_oversized_parameters_saturate() {
        let mut recording = RecordingConfiguration::default();
        recording.video.bitrate_kbps = u32::MAX;
        recording.fragment_length_ms = u64::MAX;
        recording.audio.sample_rate_khz = u32::MAX;

        let cam = camera(false);
        let args = build_recording_args(&cam, &cam.source_tokens(), &recording, false);

        let max_kbps = format!("{}k", u32::MAX);
        let max_us = u64::MAX.to_string();
        let max_hz = u32::MAX.to_string();
        assert_eq!(value_after(&args, "-bufsize"), Some(max_kbps.as_str()));
        assert_eq!(value_after(&args, "-frag_duration"), Some(max_us.as_str()));
        assert_eq!(value_after(&args, "-ar"), Some(max_hz.as_str()));
    }

    #[test]
    fn test_extra_output_args_are_appended() {
        let mut cam = camera(true);
        cam.extra_output_args = vec!["-threads".to_string(), "2".to_string()];
        let args = build_recording_args(
            &cam,
            &cam.source_tokens(),
            &RecordingConfiguration::default(),
            false,
        );

        assert_eq!(&args[args.len() - 2..], &["-threads", "2"]);
    }
}
