//! One-shot hardware acceleration probe.
//!
//! Each candidate encoder is exercised once against a null sink; the first
//! that works wins. The result is cached for the lifetime of the process.

use std::process::Stdio;

use tokio::sync::OnceCell;

/// Hardware encoder family available on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccel {
    /// Software encoding only
    None,
    /// Intel/AMD VA-API
    Vaapi,
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync
    Qsv,
}

static HW_ACCEL: OnceCell<HwAccel> = OnceCell::const_new();

/// Detects hardware acceleration, probing at most once per process.
pub async fn detect_hw_accel() -> HwAccel {
    *HW_ACCEL.get_or_init(probe).await
}

async fn probe() -> HwAccel {
    if try_encode(&[
        "-init_hw_device", "vaapi=va:/dev/dri/renderD128",
        "-f", "lavfi",
        "-i", "nullsrc=s=1920x1080:d=1",
        "-vf", "format=nv12,hwupload",
        "-c:v", "h264_vaapi",
        "-f", "null",
        "-t", "0.1",
        "-",
    ])
    .await
    {
        tracing::info!("hardware acceleration: VAAPI");
        return HwAccel::Vaapi;
    }

    if try_encode(&[
        "-f", "lavfi",
        "-i", "nullsrc=s=1920x1080:d=1",
        "-c:v", "h264_nvenc",
        "-f", "null",
        "-t", "0.1",
        "-",
    ])
    .await
    {
        tracing::info!("hardware acceleration: NVENC");
        return HwAccel::Nvenc;
    }

    if try_encode(&[
        "-f", "lavfi",
        "-i", "nullsrc=s=1920x1080:d=1",
        "-c:v", "h264_qsv",
        "-f", "null",
        "-t", "0.1",
        "-",
    ])
    .await
    {
        tracing::info!("hardware acceleration: QSV");
        return HwAccel::Qsv;
    }

    tracing::info!("hardware acceleration: none detected, using software encoding");
    HwAccel::None
}

async fn try_encode(args: &[&str]) -> bool {
    tokio::process::Command::new("ffmpeg")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
