//!
//! CLI фонемного распознавателя (TIMIT-алфавит, attention encoder-decoder).

mod search;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use audio::Normalization;
use lvsr_core::{DataStream, PhonemeAlphabet, RecognizerConfig};
use lvsr_data::{build_feature_stream, build_stream, ManifestDataset};
use lvsr_model::{load_params, BeamSearch, PhonemeRecognizer};
use lvsr_train::{CheckpointStore, LoopState, MainLoop};

#[derive(Parser)]
#[command(name = "lvsr")]
#[command(author, version, about = "LVSR: attention-based phoneme recognition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Посчитать среднее и std признаков по датасету и сохранить в JSON
    InitNorm {
        /// Манифест корпуса
        #[arg(long)]
        dataset: PathBuf,

        /// Куда записать нормализацию
        #[arg(long)]
        output: PathBuf,

        /// JSON-патч конфигурации
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Показать первые батчи потока данных
    ShowData {
        #[arg(long)]
        dataset: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Сколько батчей напечатать
        #[arg(long, default_value_t = 3)]
        num_batches: usize,
    },

    /// Обучить распознаватель
    Train {
        /// Обучающий манифест
        #[arg(long)]
        train: PathBuf,

        /// Валидационный манифест
        #[arg(long)]
        valid: Option<PathBuf>,

        /// Каталог чекпоинта
        #[arg(long)]
        save: PathBuf,

        /// Остановиться после N батчей
        #[arg(long)]
        num_batches: usize,

        /// Остановиться после N эпох
        #[arg(long)]
        num_epochs: Option<usize>,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Продолжить с чекпоинта в `--save`, если он есть
        #[arg(long, default_value_t = false)]
        resume: bool,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Beam search по датасету с отчётом о PER
    Search {
        /// Каталог чекпоинта
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        dataset: PathBuf,

        /// Ширина луча (по умолчанию из конфигурации чекпоинта)
        #[arg(long)]
        beam_size: Option<usize>,

        /// Обработать только первые N высказываний
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitNorm {
            dataset,
            output,
            config,
        } => run_init_norm(&dataset, &output, config.as_deref()),
        Commands::ShowData {
            dataset,
            config,
            num_batches,
        } => run_show_data(&dataset, config.as_deref(), num_batches),
        Commands::Train {
            train,
            valid,
            save,
            num_batches,
            num_epochs,
            config,
            resume,
            device,
        } => run_train(TrainArgs {
            train,
            valid,
            save,
            num_batches,
            num_epochs,
            config,
            resume,
            device,
        }),
        Commands::Search {
            checkpoint,
            dataset,
            beam_size,
            limit,
            device,
        } => run_search(&checkpoint, &dataset, beam_size, limit, &device),
    }
}

fn run_init_norm(dataset: &Path, output: &Path, config: Option<&Path>) -> Result<()> {
    let mut config = RecognizerConfig::load(config)?;
    // статистики считаются по ненормализованным признакам
    config.data.normalization = None;
    let alphabet = PhonemeAlphabet::timit();

    let start = Instant::now();
    let mut stream = build_feature_stream(ManifestDataset::open(dataset, alphabet)?, &config)?;
    let normalization = Normalization::fit(&mut stream)?;
    normalization
        .save(output)
        .with_context(|| format!("Не удалось записать {}", output.display()))?;

    println!(
        "Нормализация по {} признакам сохранена в {} ({:.2}s)",
        normalization.num_features(),
        output.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn run_show_data(dataset: &Path, config: Option<&Path>, num_batches: usize) -> Result<()> {
    let config = RecognizerConfig::load(config)?;
    let alphabet = PhonemeAlphabet::timit();
    let mut stream = build_stream(
        ManifestDataset::open(dataset, alphabet.clone())?,
        &config,
        alphabet.eos(),
    )?;

    for (number, item) in stream.epoch_iter().take(num_batches).enumerate() {
        let batch = match item {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Батч {number} отброшен: {e}");
                continue;
            }
        };
        println!(
            "Батч {number}: {} записей, recordings ({}, {}, {}), labels ({}, {})",
            batch.batch_size(),
            batch.max_frames(),
            batch.batch_size(),
            batch.num_features,
            batch.max_labels(),
            batch.batch_size()
        );
        for (b, id) in batch.ids.iter().enumerate() {
            let labels: Vec<u32> = (0..batch.label_lengths[b])
                .map(|t| batch.labels[t * batch.batch_size() + b])
                .collect();
            println!(
                "  {id}: {} фреймов | {}",
                batch.recording_lengths[b],
                alphabet.decode(&labels)
            );
        }
    }
    Ok(())
}

struct TrainArgs {
    train: PathBuf,
    valid: Option<PathBuf>,
    save: PathBuf,
    num_batches: usize,
    num_epochs: Option<usize>,
    config: Option<PathBuf>,
    resume: bool,
    device: String,
}

fn run_train(args: TrainArgs) -> Result<()> {
    let alphabet = PhonemeAlphabet::timit();
    let device = create_device(&args.device)?;
    let store = CheckpointStore::new(&args.save);

    let (config, resumed_log) = if args.resume && store.exists() {
        if args.config.is_some() {
            warn!("--config игнорируется: используется конфигурация чекпоинта");
        }
        let state = store.load_state()?;
        state.config.validate()?;
        (state.config, Some(state.log))
    } else {
        (RecognizerConfig::load(args.config.as_deref())?, None)
    };

    println!("LVSR - обучение");
    println!("================");
    println!("Train: {}", args.train.display());
    println!("Save: {}", args.save.display());
    println!("Alphabet: {alphabet}");
    println!("Device: {}", args.device);
    println!();

    let recognizer = PhonemeRecognizer::new(&config, &alphabet, &device)?;
    if resumed_log.is_some() {
        load_params(&recognizer.params(), &store.params_path())?;
    }

    let train_stream = build_stream(
        ManifestDataset::open(&args.train, alphabet.clone())?,
        &config,
        alphabet.eos(),
    )?;
    let mut main_loop = MainLoop::new(recognizer, config.clone(), train_stream)
        .with_checkpoints(store)
        .finish_after_batches(args.num_batches);
    if let Some(valid) = &args.valid {
        let valid_stream = build_stream(
            ManifestDataset::open(valid, alphabet.clone())?,
            &config,
            alphabet.eos(),
        )?;
        main_loop = main_loop.with_validation(Box::new(valid_stream));
    }
    if let Some(num_epochs) = args.num_epochs {
        main_loop = main_loop.finish_after_epochs(num_epochs);
    }
    if let Some(log) = resumed_log {
        main_loop = main_loop.resume_from(log);
    }

    let start = Instant::now();
    let state = main_loop.run()?;
    let status = &main_loop.log().status;
    println!(
        "Итераций: {}, эпох: {}, время {:.1}s",
        status.iterations_done,
        status.epochs_done,
        start.elapsed().as_secs_f64()
    );
    if state == LoopState::Aborted {
        warn!("Последний чекпоинт сохранён в {}", args.save.display());
    }
    main_loop.ensure_converged()?;
    Ok(())
}

fn run_search(
    checkpoint: &Path,
    dataset: &Path,
    beam_size: Option<usize>,
    limit: Option<usize>,
    device: &str,
) -> Result<()> {
    let alphabet = PhonemeAlphabet::timit();
    let device = create_device(device)?;
    let store = CheckpointStore::new(checkpoint);
    let state = store
        .load_state()
        .with_context(|| format!("Чекпоинт не найден: {}", checkpoint.display()))?;
    let config = state.config;
    config.validate()?;

    let recognizer = PhonemeRecognizer::new(&config, &alphabet, &device)?;
    load_params(&recognizer.params(), &store.params_path())?;

    let mut search = BeamSearch::new(&config.search)?;
    if let Some(beam_size) = beam_size {
        search = search.with_beam_size(beam_size);
    }
    let mut stream = build_feature_stream(ManifestDataset::open(dataset, alphabet.clone())?, &config)?;

    let average = search::run(&recognizer, &search, &alphabet, stream.as_mut(), limit)?;
    println!("Итоговый PER: {average:.4}");
    Ok(())
}

fn create_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "metal" => {
            // candle может panic при инициализации Metal, если устройство недоступно.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| candle_core::Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}
