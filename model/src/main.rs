use scae_model::model::{AutoencoderBuilder, AutoencoderConfig, Result};
use scae_model::train_data::SyntheticLoader;
use tracing_subscriber::EnvFilter;

fn run() -> Result<()> {
    println!("🚀 AUTOENCODEUR À CAPSULES EMPILÉES");
    println!("===================================\n");

    // Configuration: fichier JSON optionnel en premier argument
    let config = match std::env::args().nth(1) {
        Some(path) => {
            println!("📄 Configuration: {}", path);
            AutoencoderConfig::from_file(&path)?
        }
        None => AutoencoderConfig::default(),
    };

    println!("🏗️  Construction du modèle...");
    let model = AutoencoderBuilder::new().with_config(config.clone()).build()?;
    println!("✅ Modèle construit avec succès\n");

    model.diagnostic()?;
    println!();

    println!("📁 Génération d'un lot synthétique...");
    let n_classes = config.n_classes.unwrap_or(4);
    let mut loader = SyntheticLoader::new(config.image_shape, n_classes, config.seed)?;
    let batch = loader.next_record(8, &config.input_key, config.label_key.as_deref());

    println!("🎯 Passe avant...\n");
    let output = model.forward(&batch)?;
    let report = model.report(&output)?;

    println!("📊 Perte: {:.4} | rec_ll: {:.4} | log_prob: {:.4}", output.loss, output.rec_ll, output.log_prob());
    println!("{}", report.to_json()?);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("❌ {}", err);
        std::process::exit(1);
    }
}
