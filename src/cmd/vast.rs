//! VastAI management: `media-sync vast ...`.

use anyhow::{Context, Result, bail};
use console::style;
use std::collections::BTreeMap;
use std::sync::Arc;

use media_sync::config::MediaSyncConfig;
use media_sync::ssh::keys::read_public_key;
use media_sync::vast::{CreateInstance, Instance, OfferQuery, VastApi, VastClient};

use super::super::VastCommands;
use super::print_json;

/// Parse repeated `KEY=VALUE` flags.
fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --env '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid --env '{}': empty key", pair);
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_instance(instance: &Instance) {
    let status = instance.actual_status.as_deref().unwrap_or("unknown");
    let status = if instance.is_running() {
        style(status).green().to_string()
    } else {
        style(status).yellow().to_string()
    };
    let ssh = match (&instance.ssh_host, instance.ssh_port) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        _ => "-".to_string(),
    };
    println!(
        "{:>10}  {:<10} {:<16} {:>2}x  ${:<7} {:<28} {}",
        instance.id,
        status,
        instance.gpu_name.as_deref().unwrap_or("-"),
        opt(instance.num_gpus),
        instance
            .dph_total
            .map(|p| format!("{:.3}", p))
            .unwrap_or_else(|| "-".into()),
        ssh,
        instance.label.as_deref().unwrap_or("")
    );
}

pub async fn cmd_vast(config: Arc<MediaSyncConfig>, command: VastCommands, json: bool) -> Result<()> {
    let client = VastClient::from_config(&config.toml.vast, config.api_key())
        .context("VastAI commands need an API key ([vast] api_key or VAST_API_KEY)")?;
    run(&client, &config, command, json).await
}

async fn run(
    vast: &dyn VastApi,
    config: &MediaSyncConfig,
    command: VastCommands,
    json: bool,
) -> Result<()> {
    match command {
        VastCommands::Instances => {
            let instances = vast.list_instances().await?;
            if json {
                return print_json(&instances);
            }
            if instances.is_empty() {
                println!("No instances.");
            }
            for instance in &instances {
                print_instance(instance);
            }
        }
        VastCommands::Show { id } => {
            let instance = vast.show_instance(id).await?;
            if json {
                return print_json(&instance);
            }
            print_instance(&instance);
            if let Some(msg) = &instance.status_msg {
                println!("  {}", style(msg.trim()).dim());
            }
            match instance.ssh_endpoint(&config.toml.ssh.user, None) {
                Ok(endpoint) => println!(
                    "  ssh -p {} {}",
                    endpoint.port,
                    endpoint.destination()
                ),
                Err(e) => println!("  {}", style(e).dim()),
            }
        }
        VastCommands::Offers {
            gpu,
            num_gpus,
            max_price,
            min_reliability,
            min_gpu_ram,
            min_inet_down,
            unverified,
            interruptible,
            limit,
        } => {
            let query = OfferQuery {
                gpu_name: gpu,
                num_gpus,
                max_dph: max_price,
                min_reliability,
                min_gpu_ram_gb: min_gpu_ram,
                min_inet_down,
                verified_only: !unverified,
                interruptible,
                limit,
            };
            let offers = vast.search_offers(&query).await?;
            if json {
                return print_json(&offers);
            }
            if offers.is_empty() {
                println!("No offers match.");
                return Ok(());
            }
            println!(
                "{:>10}  {:<16} {:>3} {:>7} {:>8} {:>6} {:>8}  {}",
                "OFFER", "GPU", "N", "VRAM", "$/HR", "REL", "DOWN", "LOCATION"
            );
            for offer in &offers {
                println!(
                    "{:>10}  {:<16} {:>3} {:>7} {:>8} {:>6} {:>8}  {}",
                    offer.id,
                    offer.gpu_name.as_deref().unwrap_or("-"),
                    opt(offer.num_gpus),
                    offer
                        .gpu_ram
                        .map(|mb| format!("{:.0}G", mb / 1000.0))
                        .unwrap_or_else(|| "-".into()),
                    offer
                        .dph_total
                        .map(|p| format!("{:.3}", p))
                        .unwrap_or_else(|| "-".into()),
                    offer
                        .reliability2
                        .map(|r| format!("{:.3}", r))
                        .unwrap_or_else(|| "-".into()),
                    offer
                        .inet_down
                        .map(|d| format!("{:.0}", d))
                        .unwrap_or_else(|| "-".into()),
                    offer.geolocation.as_deref().unwrap_or("")
                );
            }
        }
        VastCommands::Create {
            offer_id,
            image,
            disk_gb,
            label,
            ports,
            env,
            attach_key,
        } => {
            let mut request = CreateInstance::from_config(&config.toml.vast);
            if let Some(image) = image {
                request.image = image;
            }
            if let Some(disk) = disk_gb {
                if disk <= 0.0 {
                    bail!("--disk-gb must be positive");
                }
                request.disk = disk;
            }
            request.label = label;
            request.env.extend(parse_env(&env)?);
            for port in ports {
                request.expose_port(port);
            }

            // Read the key up front so a missing key fails before renting.
            let public_key = if attach_key {
                Some(read_public_key(&config.default_identity_file())?)
            } else {
                None
            };

            let instance_id = vast.create_instance(offer_id, &request).await?;
            if let Some(key) = &public_key {
                vast.attach_ssh_key(instance_id, key).await?;
            }

            if json {
                return print_json(&serde_json::json!({
                    "instance_id": instance_id,
                    "key_attached": public_key.is_some(),
                }));
            }
            println!(
                "{} instance {} from offer {}",
                style("Created").green().bold(),
                instance_id,
                offer_id
            );
            if public_key.is_some() {
                println!("Attached {}", config.default_identity_file().display());
            }
            println!(
                "Add it as a target with instance_id = {} once it is running.",
                instance_id
            );
        }
        VastCommands::Destroy { id, yes } => {
            if !yes {
                bail!("Destroying instance {} deletes its disk; re-run with --yes", id);
            }
            vast.destroy_instance(id).await?;
            if json {
                return print_json(&serde_json::json!({"instance_id": id, "destroyed": true}));
            }
            println!("{} instance {}", style("Destroyed").red().bold(), id);
        }
        VastCommands::AttachKey { id, key } => {
            let private_key = key.unwrap_or_else(|| config.default_identity_file());
            let public_key = read_public_key(&private_key)?;
            vast.attach_ssh_key(id, &public_key).await?;
            if json {
                return print_json(&serde_json::json!({"instance_id": id, "attached": true}));
            }
            println!("Attached {} to instance {}", private_key.display(), id);
        }
    }
    Ok(())
}
