use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// 抽帧参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// 每隔多少帧取一帧
    pub stride: NonZeroUsize,
    /// 转灰度后做 JET 伪彩色映射
    pub colorize: bool,
}

/// 视频基本信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: usize,
}

/// 视频抽帧器：按帧号直接 seek 解码，把采样帧写成 PNG
pub struct FrameExtractor {
    input_path: PathBuf,
}

impl FrameExtractor {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self> {
        ffmpeg::init().context("初始化 FFmpeg 失败")?;

        // 只输出 ERROR 级别以上的 FFmpeg 日志
        unsafe {
            ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
        }

        Ok(Self {
            input_path: input_path.as_ref().to_path_buf(),
        })
    }

    /// 获取视频信息
    pub fn probe(&self) -> Result<VideoInfo> {
        Ok(OpenedVideo::open(&self.input_path)?.info())
    }

    /// 抽帧并写入 `output_dir`，返回按帧号升序排列的文件路径
    ///
    /// 视频无法打开时记录警告并返回空列表；某一帧解码失败时停止，
    /// 返回已经写出的帧。
    pub fn extract_to_dir(&self, output_dir: &Path, options: ExtractOptions) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("创建输出目录失败: {}", output_dir.display()))?;

        let mut video = match OpenedVideo::open(&self.input_path) {
            Ok(video) => video,
            Err(e) => {
                warn!("⚠️  [抽帧] 无法读取视频文件 {}: {:#}", self.input_path.display(), e);
                return Ok(Vec::new());
            }
        };

        let info = video.info();
        let stride = options.stride.get();
        info!(
            "📊 [抽帧] 视频共 {} 帧, {:.2} FPS, {}x{}, 步长 {}, 预计提取 {} 帧",
            info.total_frames,
            info.fps,
            info.width,
            info.height,
            stride,
            info.total_frames.div_ceil(stride)
        );

        let start = Instant::now();
        let mut saved = Vec::new();

        for frame_index in sample_indices(info.total_frames, options.stride) {
            let frame = match video.decode_at(frame_index) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    warn!("⚠️  [抽帧] 第 {} 帧读取失败，停止抽帧", frame_index);
                    break;
                }
                Err(e) => {
                    warn!("⚠️  [抽帧] 第 {} 帧解码失败，停止抽帧: {:#}", frame_index, e);
                    break;
                }
            };

            let frame = if options.colorize {
                apply_jet(&DynamicImage::ImageRgb8(frame).to_luma8())
            } else {
                frame
            };

            let output_path = output_dir.join(frame_file_name(frame_index));
            frame
                .save(&output_path)
                .with_context(|| format!("保存视频帧失败: {}", output_path.display()))?;
            debug!("💾 [抽帧] 已保存: {}", output_path.display());
            saved.push(output_path);
        }

        info!(
            "✅ [抽帧] 完成，共提取 {} 帧，耗时 {:.2}秒",
            saved.len(),
            start.elapsed().as_secs_f64()
        );

        Ok(saved)
    }
}

/// 抽帧的便捷入口
pub fn split_video_to_frames(
    video_path: &Path,
    output_dir: &Path,
    options: ExtractOptions,
) -> Result<Vec<PathBuf>> {
    FrameExtractor::new(video_path)?.extract_to_dir(output_dir, options)
}

/// 采样的帧号：`0, S, 2S, …`，小于 `total`，共 `ceil(total / S)` 个
pub fn sample_indices(total: usize, stride: NonZeroUsize) -> impl Iterator<Item = usize> {
    (0..total).step_by(stride.get())
}

/// 帧文件名，帧号补零到 5 位
pub fn frame_file_name(frame_index: usize) -> String {
    format!("frame_{:05}.png", frame_index)
}

/// 总帧数：优先使用容器记录的帧数，没有时用时长 × 帧率估算
pub fn estimate_frame_count(nb_frames: i64, duration_secs: f64, fps: f64) -> usize {
    if nb_frames > 0 {
        return nb_frames as usize;
    }
    let estimated = duration_secs * fps;
    if estimated.is_finite() && estimated > 0.0 {
        estimated.round() as usize
    } else {
        0
    }
}

/// 灰度图经 JET 调色板映射为彩色
pub fn apply_jet(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        Rgb(jet(gray.get_pixel(x, y)[0]))
    })
}

/// JET 调色板：深蓝 → 青 → 黄 → 深红
fn jet(value: u8) -> [u8; 3] {
    let x = value as f32 / 255.0;
    let channel = |center: f32| {
        let v = (1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

fn rational_to_f64(rate: ffmpeg::Rational) -> Option<f64> {
    if rate.numerator() > 0 && rate.denominator() > 0 {
        Some(rate.numerator() as f64 / rate.denominator() as f64)
    } else {
        None
    }
}

/// 已打开的视频及其解码器
struct OpenedVideo {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    start_pts: i64,
    fps: f64,
    total_frames: usize,
}

impl OpenedVideo {
    fn open(path: &Path) -> Result<Self> {
        let ictx = ffmpeg::format::input(&path).context("无法打开视频文件")?;

        let (stream_index, time_base, fps, nb_frames, stream_duration, start_time, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .context("未找到视频流")?;
            let fps = rational_to_f64(stream.avg_frame_rate())
                .or_else(|| rational_to_f64(stream.rate()))
                .unwrap_or(30.0);
            (
                stream.index(),
                stream.time_base(),
                fps,
                stream.frames(),
                stream.duration(),
                stream.start_time(),
                stream.parameters(),
            )
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("无法创建解码器上下文")?
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let duration_secs = if stream_duration > 0 && stream_duration != ffmpeg::ffi::AV_NOPTS_VALUE {
            stream_duration as f64 * f64::from(time_base)
        } else {
            ictx.duration().max(0) as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        };

        let start_pts = if start_time == ffmpeg::ffi::AV_NOPTS_VALUE {
            0
        } else {
            start_time
        };

        Ok(Self {
            ictx,
            decoder,
            scaler: None,
            stream_index,
            time_base,
            start_pts,
            fps,
            total_frames: estimate_frame_count(nb_frames, duration_secs, fps),
        })
    }

    fn info(&self) -> VideoInfo {
        VideoInfo {
            fps: self.fps,
            width: self.decoder.width(),
            height: self.decoder.height(),
            total_frames: self.total_frames,
        }
    }

    /// 一帧在流时间基下的时长
    fn ticks_per_frame(&self) -> f64 {
        let tb = f64::from(self.time_base);
        if tb > 0.0 {
            1.0 / (tb * self.fps)
        } else {
            1.0
        }
    }

    /// seek 到第 `frame_index` 帧之前最近的关键帧，向后解码直到到达目标帧
    fn decode_at(&mut self, frame_index: usize) -> Result<Option<RgbImage>> {
        let ticks = self.ticks_per_frame();
        let target_pts = self.start_pts + (frame_index as f64 * ticks).round() as i64;
        let tolerance = (ticks / 2.0).floor() as i64;

        let ret = unsafe {
            ffmpeg::sys::av_seek_frame(
                self.ictx.as_mut_ptr(),
                self.stream_index as i32,
                target_pts,
                ffmpeg::sys::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            anyhow::bail!("seek 失败 (错误码 {})", ret);
        }
        self.decoder.flush();

        let Self {
            ictx,
            decoder,
            scaler,
            stream_index,
            ..
        } = self;
        let mut decoded = ffmpeg::frame::Video::empty();

        for (stream, packet) in ictx.packets() {
            if stream.index() != *stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            while decoder.receive_frame(&mut decoded).is_ok() {
                if reached(&decoded, target_pts, tolerance) {
                    return convert_frame(scaler, &decoded).map(Some);
                }
            }
        }

        // 读到文件末尾，取出解码器中剩余的帧
        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded).is_ok() {
            if reached(&decoded, target_pts, tolerance) {
                return convert_frame(scaler, &decoded).map(Some);
            }
        }

        Ok(None)
    }
}

fn reached(frame: &ffmpeg::frame::Video, target_pts: i64, tolerance: i64) -> bool {
    match frame.timestamp().or_else(|| frame.pts()) {
        Some(pts) => pts + tolerance >= target_pts,
        None => true,
    }
}

/// 转换为 RGB24，再拷贝成 RgbImage（去掉行尾填充）
fn convert_frame(
    scaler: &mut Option<ffmpeg::software::scaling::Context>,
    frame: &ffmpeg::frame::Video,
) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());

    let needs_new_scaler = match scaler {
        Some(s) => s.input().format != frame.format() || s.input().width != width || s.input().height != height,
        None => true,
    };
    if needs_new_scaler {
        *scaler = Some(
            ffmpeg::software::scaling::Context::get(
                frame.format(),
                width,
                height,
                ffmpeg::format::Pixel::RGB24,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .context("无法创建缩放器")?,
        );
    }

    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler
        .as_mut()
        .context("缩放器未初始化")?
        .run(frame, &mut rgb_frame)
        .context("像素格式转换失败")?;

    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let row_bytes = width as usize * 3;
    let mut buf = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let row = data
            .get(y * stride..y * stride + row_bytes)
            .context("帧数据长度不足")?;
        buf.extend_from_slice(row);
    }

    RgbImage::from_raw(width, height, buf).context("无法构建 RGB 图像")
}
