use std::error::Error;
use std::time::Instant;

use presto::Predictor;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(
    name = "convert",
    about = "Converts a single-file model into the memory-mapped form."
)]
struct Args {
    #[clap(short = 'i', long)]
    input_filename: String,

    #[clap(short = 'o', long)]
    output_dirname: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    eprintln!("Loading the model...: {}", &args.input_filename);
    let start = Instant::now();
    let predictor = Predictor::load(&args.input_filename)?;
    eprintln!("{} seconds", start.elapsed().as_secs_f64());

    eprintln!("Writing the mapped model...: {}", &args.output_dirname);
    let start = Instant::now();
    predictor.save_as_memory_mapped(&args.output_dirname)?;
    eprintln!("{} seconds", start.elapsed().as_secs_f64());

    Ok(())
}
