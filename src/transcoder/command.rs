//! FFmpegコマンド引数の生成
//!
//! 入力（リクエストと解決済みエンコーダー名）だけから決まる純粋関数。

use super::{ConversionRequest, HwAccelType, QualityMode};

/// 常に再エンコードするオーディオコーデック
pub const AUDIO_CODEC: &str = "aac";

/// コマンドビルダー
pub struct CommandBuilder;

impl CommandBuilder {
    /// 1ファイル分のFFmpeg引数を生成（プログラム名は含まない）
    ///
    /// 出力パスは常に最後の引数になる。
    pub fn build(request: &ConversionRequest, encoder: &str) -> Vec<String> {
        let hwaccel = HwAccelType::from_encoder_name(encoder);
        let mut args = Vec::new();

        Self::add_global_args(request, &mut args);
        Self::add_hwaccel_args(hwaccel, &mut args);

        args.push("-i".to_string());
        args.push(request.input_path.to_string_lossy().to_string());

        args.push("-c:v".to_string());
        args.push(encoder.to_string());

        Self::add_scale_args(request, hwaccel, &mut args);
        Self::add_preset_args(request, hwaccel, &mut args);
        Self::add_quality_args(request, hwaccel, &mut args);

        args.push("-c:a".to_string());
        args.push(AUDIO_CODEC.to_string());

        // 上書き確認なし
        args.push("-y".to_string());
        args.push(request.resolved_output_path().to_string_lossy().to_string());

        args
    }

    /// スレッド数とグローバルフラグ
    fn add_global_args(request: &ConversionRequest, args: &mut Vec<String>) {
        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-threads".to_string());
        args.push(request.threads.max(1).to_string());
    }

    /// HW初期化フラグ（入力指定より前、ソフトウェアでは何もしない）
    fn add_hwaccel_args(hwaccel: HwAccelType, args: &mut Vec<String>) {
        let flags: &[&str] = match hwaccel {
            HwAccelType::Nvenc => &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"],
            HwAccelType::Qsv => &[
                "-init_hw_device",
                "qsv=hw",
                "-filter_hw_device",
                "hw",
                "-hwaccel",
                "qsv",
                "-hwaccel_output_format",
                "qsv",
            ],
            HwAccelType::Amf => &["-hwaccel", "d3d11va"],
            HwAccelType::Software => &[],
        };
        args.extend(flags.iter().map(|s| s.to_string()));
    }

    /// スケーリングフィルター（解像度維持なら省略）
    fn add_scale_args(request: &ConversionRequest, hwaccel: HwAccelType, args: &mut Vec<String>) {
        if request.keeps_source_resolution() {
            return;
        }

        // 片方だけ0ならアスペクト比を維持
        let width = Self::dimension(request.width);
        let height = Self::dimension(request.height);

        let filter = match hwaccel {
            HwAccelType::Nvenc => format!("scale_cuda={}:{}", width, height),
            HwAccelType::Qsv => format!("scale_qsv=w={}:h={}", width, height),
            HwAccelType::Amf | HwAccelType::Software => format!("scale={}:{}", width, height),
        };

        args.push("-vf".to_string());
        args.push(filter);
    }

    fn dimension(value: u32) -> String {
        if value == 0 {
            "-2".to_string()
        } else {
            value.to_string()
        }
    }

    /// プリセット（ベンダーごとに引数名と値が異なる）
    fn add_preset_args(request: &ConversionRequest, hwaccel: HwAccelType, args: &mut Vec<String>) {
        let (flag, value) = match hwaccel {
            HwAccelType::Nvenc => ("-preset", request.preset.nvenc_name()),
            HwAccelType::Qsv => ("-preset", request.preset.qsv_name()),
            HwAccelType::Amf => ("-quality", request.preset.amf_quality()),
            HwAccelType::Software => ("-preset", request.preset.ffmpeg_name()),
        };
        args.push(flag.to_string());
        args.push(value.to_string());
    }

    /// ビットレートか固定品質のどちらか一方だけ
    fn add_quality_args(request: &ConversionRequest, hwaccel: HwAccelType, args: &mut Vec<String>) {
        match request.quality {
            QualityMode::Bitrate(ref bitrate) => {
                args.push("-b:v".to_string());
                args.push(bitrate.clone());
            }
            QualityMode::ConstantQuality(quality) => {
                let quality = quality.to_string();
                match hwaccel {
                    HwAccelType::Nvenc => {
                        args.push("-cq".to_string());
                        args.push(quality);
                    }
                    HwAccelType::Qsv => {
                        args.push("-global_quality".to_string());
                        args.push(quality);
                    }
                    HwAccelType::Amf => {
                        args.extend(["-rc", "cqp", "-qp_i"].map(String::from));
                        args.push(quality.clone());
                        args.push("-qp_p".to_string());
                        args.push(quality);
                    }
                    HwAccelType::Software => {
                        args.push("-crf".to_string());
                        args.push(quality);
                    }
                }
            }
        }
    }
}
