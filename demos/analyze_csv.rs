use analyst_sandbox::{Sandbox, SandboxConfig};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Analyst Sandbox Demo ===\n");

    let sandbox = Sandbox::new(SandboxConfig::from_env())?;
    let caps = sandbox.capabilities();
    println!(
        "Engine: {} ({})",
        caps.name,
        caps.interpreter.as_deref().unwrap_or("unknown interpreter")
    );
    println!("Libraries: {}\n", caps.libraries.join(", "));

    let dir = std::env::temp_dir().join("analyst-sandbox-demo");
    std::fs::create_dir_all(&dir)?;
    let dataset: PathBuf = dir.join("sales.csv");
    std::fs::write(
        &dataset,
        "region,month,revenue\nnorth,1,120\nnorth,2,135\nsouth,1,90\nsouth,2,110\nwest,1,70\nwest,2,95\n",
    )?;

    // Example 1: Summary statistics and a grouped table
    println!("Example 1: Grouped revenue");
    let code1 = r#"
df = pd.read_csv(file_path)
by_region = df.groupby("region", as_index=False)["revenue"].sum()
print(by_region.to_string(index=False))
"#;
    let envelope = sandbox.run_sandboxed(code1, Some(&dataset), 10).await;
    println!("{}\n", envelope.summary());

    // Example 2: A chart comes back as a PNG
    println!("Example 2: Chart");
    let code2 = r#"
df = pd.read_csv(file_path)
pivot = df.pivot(index="month", columns="region", values="revenue")
pivot.plot(kind="line", marker="o")
plt.title("Revenue by region")
"#;
    let envelope = sandbox.run_sandboxed(code2, Some(&dataset), 10).await;
    println!("{}", envelope.summary());
    for (i, image) in envelope.images.iter().enumerate() {
        let path = dir.join(format!("chart_{}.png", i));
        std::fs::write(&path, image)?;
        println!("  wrote {}", path.display());
    }
    println!();

    // Example 3: Rejected before anything runs
    println!("Example 3: Validation");
    let code3 = r#"
import os
os.system("curl example.com")
"#;
    let envelope = sandbox.run_sandboxed(code3, None, 10).await;
    println!("{}\n", envelope.summary());

    // Example 4: Deadline
    println!("Example 4: Timeout");
    let envelope = sandbox.run_sandboxed("while True:\n    pass", None, 1).await;
    println!("{}", envelope.summary());

    Ok(())
}
