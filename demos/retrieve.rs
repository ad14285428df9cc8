use std::env;
use std::sync::Arc;

use grib_fetch::{Client, ClientOptions, Registry, Request, Settings};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:
  cargo run --example retrieve -- retrieve <model> <cycle> <leads> [search] [product]
  cargo run --example retrieve -- latest <model> [product]
  cargo run --example retrieve -- inventory <model> <cycle> <lead> [product]

Examples:
  cargo run --example retrieve -- retrieve hrrr 2024-03-01T12Z 0/to/6 ':TMP:2 m above ground' sfc
  cargo run --example retrieve -- latest gfs

Set GRIB_FETCH_SETTINGS to a YAML settings file to override options or providers,
and RUST_LOG=grib_fetch=debug to follow each pipeline stage.";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grib_fetch=info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("{USAGE}");
        return;
    }

    let client = match build_client() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot create client: {e}");
            std::process::exit(2);
        }
    };

    let outcome = match args[1].as_str() {
        "retrieve" => retrieve(&client, &args[2..]).await,
        "latest" => latest(&client, &args[2..]).await,
        "inventory" => inventory(&client, &args[2..]).await,
        other => {
            eprintln!("unknown command {other:?}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(e) = outcome {
        eprintln!("{} failed ({}): {e}", args[1], e.kind());
        std::process::exit(1);
    }
}

fn build_client() -> grib_fetch::Result<Client> {
    match env::var("GRIB_FETCH_SETTINGS") {
        Ok(path) => Client::from_settings(&Settings::load(path)?),
        Err(_) => Client::new(ClientOptions::default(), Arc::new(Registry::builtin()?)),
    }
}

async fn retrieve(client: &Client, args: &[String]) -> grib_fetch::Result<()> {
    let [model, cycle, leads, rest @ ..] = args else {
        eprintln!("{USAGE}");
        return Ok(());
    };
    let mut base = Request::parse(model, cycle)?;
    if let Some(search) = rest.first() {
        base = base.search(search);
    }
    if let Some(product) = rest.get(1) {
        base = base.product(product);
    }

    let requests = base.for_leads(leads)?;
    for (request, result) in requests.iter().zip(client.retrieve_many(&requests, None).await) {
        match result {
            Ok(got) => println!(
                "f{:03}  {:>10} bytes  {:<7} {}{}",
                request.lead_hours(),
                got.bytes,
                got.provider,
                got.path.display(),
                if got.cache_hit { "  (cached)" } else { "" }
            ),
            Err(e) => println!("f{:03}  failed: {e}", request.lead_hours()),
        }
    }
    Ok(())
}

async fn latest(client: &Client, args: &[String]) -> grib_fetch::Result<()> {
    let model = &args[0];
    let cycle = client.latest(model, args.get(1).map(String::as_str)).await?;
    println!("{model}: {}", cycle.format("%Y-%m-%d %H:%M UTC"));
    Ok(())
}

async fn inventory(client: &Client, args: &[String]) -> grib_fetch::Result<()> {
    let [model, cycle, lead, rest @ ..] = args else {
        eprintln!("{USAGE}");
        return Ok(());
    };
    let lead: u32 = lead
        .parse()
        .map_err(|_| {
            grib_fetch::Error::InvalidRequest(format!("lead {lead:?} is not a number of hours"))
        })?;
    let mut request = Request::parse(model, cycle)?.lead(lead);
    if let Some(product) = rest.first() {
        request = request.product(product);
    }

    let inv = client.inventory(&request).await?;
    for e in &inv.entries {
        println!("{:>4}  {:>12}  {}", e.grib_message, e.byte_start, e.search_text());
    }
    if !inv.malformed.is_empty() {
        eprintln!("{} malformed index lines skipped", inv.malformed.len());
    }
    Ok(())
}
