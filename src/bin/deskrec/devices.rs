use anyhow::Result;
use deskrec::audio::{AudioBackend, EndpointInventory};

fn section(out: &mut String, title: &str, names: &[String], default: Option<&str>) {
    if names.is_empty() {
        out.push_str(&format!("No {title} detected.\n"));
        return;
    }
    out.push_str(&format!("{title}:\n"));
    for name in names {
        let marker = if Some(name.as_str()) == default {
            " (default)"
        } else {
            ""
        };
        out.push_str(&format!("  - {name}{marker}\n"));
    }
}

pub(crate) fn format_inventory(inventory: &EndpointInventory) -> String {
    let mut out = String::new();
    section(
        &mut out,
        "render endpoints (system audio)",
        &inventory.render,
        inventory.default_render.as_deref(),
    );
    section(
        &mut out,
        "capture endpoints (microphone)",
        &inventory.capture,
        inventory.default_capture.as_deref(),
    );
    out
}

/// `DESKREC_TEST_DEVICES` (`render1,render2;capture1`) replaces the real
/// device query so the listing can be exercised without audio hardware.
fn test_inventory() -> Option<EndpointInventory> {
    let raw = std::env::var("DESKREC_TEST_DEVICES").ok()?;
    let (render, capture) = raw.split_once(';').unwrap_or((raw.as_str(), ""));
    let split = |list: &str| -> Vec<String> {
        list.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    };
    let render = split(render);
    let capture = split(capture);
    Some(EndpointInventory {
        default_render: render.first().cloned(),
        default_capture: capture.first().cloned(),
        render,
        capture,
    })
}

pub(crate) fn list_devices(backend: &dyn AudioBackend) -> Result<()> {
    let inventory = match test_inventory() {
        Some(inventory) => inventory,
        None => match backend.endpoints() {
            Ok(inventory) => inventory,
            Err(err) => {
                eprintln!("Failed to list audio devices: {err:#}");
                EndpointInventory::default()
            }
        },
    };
    print!("{}", format_inventory(&inventory));
    Ok(())
}
