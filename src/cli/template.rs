use anyhow::{Context, Result};

const TEMPLATE: &str = include_str!("../../templates/proxy-template.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", TEMPLATE);
    }

    Ok(())
}
