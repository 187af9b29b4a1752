use capsnet::error::{dataset, CapsError};
use capsnet::model::{ExperimentConfig, ModelBuilder};
use capsnet::train_data::{DataLoader, DatasetKind, LoadedData, Split};
use clap::{Args, Parser, Subcommand, ValueHint};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "CapsNet avec routage dynamique par accord")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Entraîne un modèle puis l'évalue éventuellement sur le jeu de test
    Train(TrainArgs),

    /// Affiche la configuration par défaut (MNIST) en JSON
    Config {
        /// Écrit la configuration dans ce fichier au lieu de STDOUT
        #[arg(long, value_hint = ValueHint::FilePath)]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// Répertoire des données (fichiers IDX ou train/ et test/)
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// mnist, fashion-mnist ou folder
    #[arg(long, default_value = "mnist")]
    dataset: String,

    /// Configuration JSON d'expérience
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Limite le nombre d'échantillons d'entraînement
    #[arg(long)]
    limit: Option<usize>,

    /// Historique des pertes et accuracies en JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    history_out: Option<PathBuf>,

    /// Évalue sur le jeu de test après l'entraînement
    #[arg(long)]
    test: bool,

    /// Écrit quelques images et leurs reconstructions en PNG
    #[arg(long, value_hint = ValueHint::DirPath)]
    reconstructions_out: Option<PathBuf>,
}

const RECONSTRUCTION_SAMPLES: usize = 8;

fn main() -> Result<(), CapsError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Config { out } => {
            let json = serde_json::to_string_pretty(&ExperimentConfig::default())?;
            match out {
                Some(path) => fs::write(path, json)?,
                None => println!("{json}"),
            }
            Ok(())
        }
        Command::Train(args) => train(args),
    }
}

fn train(args: TrainArgs) -> Result<(), CapsError> {
    log::info!("🚀 CAPSNET - ROUTAGE DYNAMIQUE");

    let mut experiment = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        experiment.training.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        experiment.training.batch_size = batch_size;
    }
    let kind: DatasetKind = args.dataset.parse()?;

    log::info!("🏗️  Construction du modèle...");
    let mut model = ModelBuilder::new()
        .with_network_config(experiment.network.clone())
        .with_training_config(experiment.training.clone())
        .build()?;
    model.diagnostic()?;

    let loader = DataLoader::new(
        &args.data_dir,
        kind,
        experiment.network.input_shape,
        experiment.network.num_classes(),
    )
    .with_validation_size(experiment.training.validation_size)
    .with_seed(experiment.training.seed);

    let (train, validation) = match loader.load(Split::Train)? {
        LoadedData::Train { train, validation } => (train, validation),
        LoadedData::Test(_) => return Err(dataset("jeu d'entraînement attendu")),
    };
    let train = match args.limit {
        Some(limit) => train.truncate(limit),
        None => train,
    };

    model.train(&train, &validation)?;
    log::info!("🎉 Meilleure loss validation: {:.4}", model.state.best_loss);

    if let Some(path) = &args.history_out {
        fs::write(path, serde_json::to_string_pretty(&model.history)?)?;
        log::info!("💾 Historique écrit dans {}", path.display());
    }

    let mut evaluated = validation;
    if args.test {
        let test = match loader.load(Split::Test)? {
            LoadedData::Test(test) => test,
            LoadedData::Train { .. } => return Err(dataset("jeu de test attendu")),
        };
        let evaluation = model.evaluate(&test, experiment.training.batch_size)?;
        log::info!(
            "🧪 Test: loss {:.4} (margin {:.4}), accuracy {:.2}%",
            evaluation.loss.total,
            evaluation.loss.margin,
            evaluation.accuracy * 100.0
        );
        evaluation.metrics.log();
        evaluated = test;
    }

    if let Some(dir) = &args.reconstructions_out {
        model.save_reconstructions(&evaluated.images.view(), dir, RECONSTRUCTION_SAMPLES)?;
    }

    Ok(())
}
