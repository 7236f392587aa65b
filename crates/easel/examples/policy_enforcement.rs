//! Policy Enforcement Example
//!
//! Demonstrates how the `[files]` config section restricts what a snippet
//! may do in the workspace files area, independent of which capabilities it
//! calls.
//!
//! Run with: cargo run -p easel --example policy_enforcement

use std::time::Duration;

use easel::config::EaselConfig;
use easel::policy::{Operation, PolicyHandler};
use easel::sandbox::SandboxManager;
use easel::store::WorkspaceStore;

const CONFIG: &str = r#"
[files]
preset = "downloads_only"

[[files.rules]]
path = "/data/secrets/**"
effect = "deny"

[[files.rules]]
path = "/scratch/**"
effect = "allow"
capabilities = ["writeFile", "deleteFile"]
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Policy Enforcement Example ===\n");

    let dir = std::env::temp_dir().join(format!("easel-policy-{}", std::process::id()));
    let store = WorkspaceStore::new(&dir, Duration::from_secs(10));
    store.create_workspace_with_id("demo", "Demo", "").await?;

    let config = EaselConfig::from_toml_str(CONFIG)?;

    println!("--- Decisions ---");
    let policy = config.file_policy()?;
    for (path, op, capability) in [
        ("/data/input.csv", Operation::Read, "read"),
        ("/data/secrets/key.txt", Operation::Read, "read"),
        ("/scratch/tmp.json", Operation::Write, "writeFile"),
        ("/scratch/tmp.json", Operation::Write, "edit"),
        ("/downloads/out.csv", Operation::Write, "download"),
        ("/report.md", Operation::Write, "write"),
    ] {
        let decision = policy.check_access(path, op, capability);
        println!(
            "  {:<9} {:?} {:<24} -> {}",
            capability,
            op,
            path,
            decision.denial_reason().unwrap_or("allowed")
        );
    }

    println!("\n--- Inside a sandbox ---");
    let sandboxes = SandboxManager::from_config(store, &config)?;
    let sandbox = sandboxes.get_or_create("demo")?;

    for code in [
        "await write('ok', 'file:downloads/note.txt'); return 'written';",
        "try { await write('nope', 'file:report.md'); } catch (e) { return e.message; }",
        "try { return await read('file:data/secrets/key.txt'); } catch (e) { return e.message; }",
    ] {
        let output = sandbox.execute(code).await?;
        println!("  {}", output.text);
    }

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}
