use flux_install_api::InstallConfig;
use flux_install_api::toolkit::all_crds;
use flux_install_manifest::{CatalogSource, render_bundle};
use std::env;
use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const USAGE: &str = "usage: cargo run -p xtask -- crds | render <target_path> [version] | versions";

fn main() -> Result<(), DynError> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    match args.first().map(String::as_str) {
        Some("crds") => print_crds(),
        Some("render") => {
            let target_path = args.get(1).ok_or(USAGE)?;
            let version = args.get(2).map(String::as_str).unwrap_or("latest");
            print_install(target_path, version)
        }
        Some("versions") => {
            for version in CatalogSource::embedded()?.versions() {
                println!("{}", version);
            }
            Ok(())
        }
        _ => Err(USAGE.into()),
    }
}

fn print_crds() -> Result<(), DynError> {
    for crd in all_crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

fn print_install(target_path: &str, version: &str) -> Result<(), DynError> {
    let cfg = InstallConfig::builder()
        .target_path(target_path)
        .version(version)
        .build()?;
    let catalog = CatalogSource::embedded()?;
    let bundle = catalog.lookup(cfg.version())?;
    let rendered = render_bundle(&cfg, bundle)?;
    eprintln!("path: {}", rendered.path);
    eprintln!("identity: {}", rendered.identity);
    print!("{}", rendered.content);
    Ok(())
}
