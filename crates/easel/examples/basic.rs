//! Basic sandbox usage example.
//!
//! Creates a throwaway workspace, runs a few snippets against it, and shows
//! how panel updates come back embedded in the result text.
//!
//! Run with: cargo run -p easel --example basic

use std::time::Duration;

use easel::panel::extract_panel_updates;
use easel::sandbox::Sandbox;
use easel::store::WorkspaceStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = std::env::temp_dir().join(format!("easel-basic-{}", std::process::id()));
    let store = WorkspaceStore::new(&dir, Duration::from_secs(10));
    store.create_workspace_with_id("demo", "Demo", "Example workspace").await?;

    let sandbox = Sandbox::builder("demo", store.clone()).build()?;

    println!("=== Return a value ===");
    let output = sandbox.execute("return [1, 2, 3].map(x => x * x);").await?;
    println!("{}\n", output.text);

    println!("=== Logs and errors ===");
    let output = sandbox
        .execute("log('checking input'); throw new Error('bad input');")
        .await?;
    println!("{}\n", output.text);

    println!("=== Tables and panels ===");
    let output = sandbox
        .execute(
            r#"
            const rows = [
              { region: 'north', sales: 120 },
              { region: 'south', sales: 80 },
              { region: 'north', sales: 45 },
            ];
            const totals = group(rows, 'region');
            await setTable('sales', { data: rows, title: 'Sales' });
            await setMarkdown('summary', `Regions: ${Object.keys(totals).join(', ')}`);
            return 'published';
            "#,
        )
        .await?;
    let (text, updates) = extract_panel_updates(&output.text);
    println!("result: {text}");
    for update in &updates {
        println!("  {:?} {} ({})", update.action, update.panel.id, update.panel.kind.type_name());
    }

    println!("\n=== Reading back ===");
    let output = sandbox.execute("return (await read('table:sales')).length;").await?;
    println!("rows in table:sales: {}", output.text);

    let state = store.load_ui_state("demo").await?;
    println!("panels on canvas: {}", state.panels.len());

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}
