//! Configuration view and validation commands (`hive config`).

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<i32> {
    use hive::hive_config::{CONFIG_FILE, HiveConfig, HiveToml, user_config_path};
    use hive::init::get_hive_dir;

    let hive_dir = get_hive_dir(project_dir);
    let config_path = hive_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Hive Configuration");
            println!("==================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                match user_config_path() {
                    Some(path) if path.exists() => println!("Config file: {} (user defaults)", path.display()),
                    _ => println!("No hive.toml found at {}, using defaults.", config_path.display()),
                }
            }
            println!();

            let settings = HiveConfig::new(project_dir.to_path_buf())?;
            print!("{}", toml::to_string_pretty(&settings.toml)?);
            println!();
            println!("Effective values (with env overrides):");
            for agent in ["architect", "implementer", "tester", "reviewer", "documenter"] {
                if let Ok(s) = settings.toml.agent_settings(agent) {
                    println!(
                        "  {:<12} backend={} cmd=\"{}\" model={} timeout={}s attempts={}",
                        agent,
                        s.backend_name,
                        s.backend.cmd,
                        s.model.as_deref().unwrap_or("default"),
                        s.timeout.as_secs(),
                        s.max_attempts
                    );
                }
            }
            println!("  autonomous   {}", settings.autonomous());
            println!("  max_parallel {}", settings.max_parallel());
            println!();
            Ok(0)
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();
            if !config_path.exists() {
                println!("No hive.toml found. Using defaults (valid).");
                return Ok(0);
            }

            let toml = HiveToml::load(&config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
                println!();
                Ok(0)
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
                println!();
                Ok(1)
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("hive.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(0);
            }
            std::fs::create_dir_all(&hive_dir)?;
            HiveToml::default().save(&config_path)?;

            println!("Created hive.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [defaults] backend, model, max_attempts, timeout_secs, autonomous");
            println!("  - [agents.\"pattern\"] per-agent backend, model and limits");
            println!("  - [verify] build_cmd for the build_verify step");
            println!("  - [parallel] max_parallel, base_branch, merge_agent");
            println!();
            Ok(0)
        }
    }
}
