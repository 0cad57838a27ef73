use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "vitalslake", version, about = "Tiered time-series data lake")]
pub struct Args {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, default_value_t = false)]
    pub print_openapi: bool,
}
