//! Project initialization and workflow listing.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<i32> {
    use hive::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir)?;

    if result.created {
        println!("Initialized hive project at {}", result.hive_dir.display());
        println!();
        println!("Created directory structure:");
        println!("  .hive/");
        println!("  ├── hive.toml     # Configuration (`hive config show`)");
        println!("  ├── agents/       # Agent definitions (<agent>.md)");
        println!("  ├── workflows/    # Custom workflows (<name>.yaml)");
        println!("  ├── runs/         # Run state, events and checkpoints");
        println!("  └── logs/         # Diagnostic logs");
        println!();
        println!("Next steps:");
        println!("  1. Set [verify] build_cmd in .hive/hive.toml");
        println!("  2. Run `hive run \"<objective>\"` to start a run");
    } else if was_initialized {
        println!("Hive project already initialized at {}", result.hive_dir.display());
        println!("Directory structure verified.");
    } else {
        println!("Completed hive initialization at {}", result.hive_dir.display());
    }
    Ok(0)
}

pub fn cmd_workflows(project_dir: &std::path::Path) -> Result<i32> {
    use console::style;
    use hive::init::get_hive_dir;
    use hive::workflow::{Workflow, available_workflows};

    let workflows_dir = get_hive_dir(project_dir).join("workflows");
    for name in available_workflows(&workflows_dir) {
        match Workflow::load(&name, &workflows_dir) {
            Ok(workflow) => {
                let phases: Vec<String> = workflow
                    .phases
                    .iter()
                    .map(|p| {
                        let mut label = p.name.clone();
                        if !p.required {
                            label.push('?');
                        }
                        if p.checkpoint_after {
                            label.push('!');
                        }
                        label
                    })
                    .collect();
                println!(
                    "{:<12} {}",
                    style(&name).yellow().bold(),
                    workflow.description.as_deref().unwrap_or_default()
                );
                println!("             {}", style(phases.join(" → ")).dim());
            }
            Err(e) => println!("{:<12} {}", style(&name).red(), e),
        }
    }
    println!();
    println!("{}", style("? optional   ! checkpoint after").dim());
    Ok(0)
}
