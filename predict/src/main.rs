use std::error::Error;
use std::io::BufRead;

use presto::Predictor;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(name = "predict", about = "Predicts labels for lines of text from stdin.")]
struct Args {
    #[clap(short = 'm', long)]
    model_filename: String,

    #[clap(short = 'k', long, default_value_t = 1)]
    k: usize,

    #[clap(short = 't', long, default_value_t = 0.0)]
    threshold: f32,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    eprintln!("Loading the model...: {}", &args.model_filename);
    let mut predictor = Predictor::load(&args.model_filename)?;

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let predictions = predictor.predict(&line, args.k, args.threshold)?;
        let cols: Vec<String> = predictions
            .iter()
            .map(|p| format!("{} {}", p.label, p.prob))
            .collect();
        println!("{}", cols.join(" "));
    }

    predictor.close();
    Ok(())
}
