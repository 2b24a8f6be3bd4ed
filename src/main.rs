use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use radiology_serve::{
    analyze_images,
    config::{ConfigLayer, ConfigLoader, ServiceConfig, DEFAULT_CONFIG_FILE},
    handler, processor, ExtractOptions, FrameExtractor, ModelRegistry, PredictionOutcome,
    TractBackend,
};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// 医学影像分类服务 - 多模型图片/视频逐帧推理
#[derive(Parser, Debug)]
#[command(name = "radiology-serve")]
#[command(about = "医学影像分类服务：加载多个模型，对上传的图片和视频帧做推理", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（也可通过环境变量 RADIOLOGY_BIND 设置，默认 0.0.0.0:8000）
        #[arg(short, long)]
        bind: Option<String>,

        /// 配置文件路径（可选，支持 .ini 格式）
        /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
        #[arg(long)]
        config: Option<PathBuf>,

        /// 模型根目录，每个模型一个子目录
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },
    /// CLI 模式：对本地图片（或目录下全部图片）做推理，结果以 JSON 输出
    Predict {
        /// 图片文件或目录
        #[arg(short, long)]
        input: PathBuf,

        /// 模型 ID（默认使用配置中的 default_model）
        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        models_dir: Option<PathBuf>,
    },
    /// CLI 模式：只抽帧，不做推理
    Extract {
        /// 输入视频文件路径
        #[arg(short, long)]
        input: PathBuf,

        /// 输出目录
        #[arg(short, long, default_value = "./frame_output")]
        output: PathBuf,

        /// 抽帧步长（每隔多少帧取一帧）
        #[arg(long)]
        stride: Option<usize>,

        /// 对帧做 JET 伪彩色映射
        #[arg(long)]
        colorize: bool,

        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Serve {
            bind,
            config: config_file,
            models_dir,
        } => {
            let cli = ConfigLayer {
                bind,
                models_dir,
                ..Default::default()
            };
            let config = ConfigLoader::load_config(config_file.as_deref(), cli).context("加载配置失败")?;
            init_tracing(&config.log_level);
            start_web_server(config).await?;
        }
        Commands::Predict {
            input,
            model,
            config: config_file,
            models_dir,
        } => {
            let cli = ConfigLayer {
                models_dir,
                ..Default::default()
            };
            let config = ConfigLoader::load_config(config_file.as_deref(), cli).context("加载配置失败")?;
            init_tracing(&config.log_level);
            run_predict(&config, &input, model.as_deref())?;
        }
        Commands::Extract {
            input,
            output,
            stride,
            colorize,
            config: config_file,
        } => {
            let cli = ConfigLayer {
                frame_stride: stride,
                colorize: colorize.then_some(true),
                ..Default::default()
            };
            let config = ConfigLoader::load_config(config_file.as_deref(), cli).context("加载配置失败")?;
            init_tracing(&config.log_level);

            let options = ExtractOptions {
                stride: config.frame_stride,
                colorize: config.colorize,
            };
            let extractor = FrameExtractor::new(&input)?;
            match extractor.probe() {
                Ok(info) => println!(
                    "视频信息: {} 帧, {:.2} FPS, {}x{}",
                    info.total_frames, info.fps, info.width, info.height
                ),
                Err(e) => tracing::warn!("⚠️  无法读取视频信息: {:#}", e),
            }
            let frames = extractor.extract_to_dir(&output, options).context("抽帧失败")?;
            println!("共抽取 {} 帧，输出目录: {}", frames.len(), output.display());
        }
        Commands::InitConfig { path } => {
            ConfigLoader::create_default_config(&path).context("生成配置文件失败")?;
            println!("已生成配置文件: {}", path.display());
        }
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_registry(config: &ServiceConfig) -> ModelRegistry {
    let (registry, reports) = ModelRegistry::load(&config.models, &config.models_dir, &TractBackend);
    let loaded = reports.iter().filter(|r| r.is_loaded()).count();
    tracing::info!("📦 [模型] 已加载 {}/{} 个模型", loaded, reports.len());
    registry
}

fn run_predict(config: &ServiceConfig, input: &std::path::Path, model: Option<&str>) -> Result<()> {
    let registry = load_registry(config);
    let model_id = model.unwrap_or(&config.default_model);

    let images = if input.is_dir() {
        processor::collect_images(input)?
    } else {
        vec![input.to_path_buf()]
    };

    let outcomes: Vec<PredictionOutcome> = analyze_images(&registry, &images, model_id, None);
    let json = serde_json::to_string_pretty(&outcomes).context("序列化结果失败")?;
    println!("{}", json);
    Ok(())
}

async fn start_web_server(config: ServiceConfig) -> Result<()> {
    config.storage.ensure()?;

    let registry = load_registry(&config);
    if registry.is_empty() {
        tracing::warn!("⚠️  [模型] 没有任何模型加载成功，推理请求都会返回 404");
    }

    let bind = config.bind.clone();
    let frame_stride: NonZeroUsize = config.frame_stride;
    let model_ids: Vec<String> = registry.ids().map(str::to_string).collect();
    let app = handler::router(handler::AppState::new(registry, config));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("已加载模型: {:?} | 默认抽帧步长: {}", model_ids, frame_stride);
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 模型列表: GET  http://{}/models", bind);
    tracing::info!("  • 图片推理: POST http://{}/upload_image", bind);
    tracing::info!("  • 视频推理: POST http://{}/upload_video", bind);
    tracing::info!("  • 帧图片:   GET  http://{}/frames/<id>/<file>", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
