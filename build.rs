use grep::regex::RegexMatcher;
use grep::searcher::Searcher;
use grep::searcher::sinks::UTF8;
use std::error::Error;
use std::path::Path;
use walkdir::WalkDir;

// Source trees owned by this crate. Nothing outside them is scanned.
const SOURCE_DIRS: [&str; 4] = ["score", "cli", "tests", "benches"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    emit_build_timestamp();

    // Scan Rust source files for #[allow(dead_code)] attributes and fail if found.
    if let Err(e) = scan_for_allow_dead_code() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn emit_build_timestamp() {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=DIARISK_BUILD_TIMESTAMP={timestamp}");
}

fn scan_for_allow_dead_code() -> Result<(), Box<dyn Error>> {
    let pattern = r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]";
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();
    let mut violations = Vec::new();

    for dir in SOURCE_DIRS.iter().map(Path::new).filter(|p| p.is_dir()) {
        for entry in WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        {
            let path = entry.path();
            searcher.search_path(
                &matcher,
                path,
                UTF8(|line_number, line| {
                    violations.push(format!(
                        "{}:{}: {}",
                        path.display(),
                        line_number,
                        line.trim()
                    ));
                    Ok(true)
                }),
            )?;
        }
    }

    if violations.is_empty() {
        return Ok(());
    }

    let mut error_msg = format!(
        "\n❌ ERROR: Found {} #[allow(dead_code)] attributes:\n",
        violations.len()
    );
    for violation in &violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push_str("\n⚠️ Dead code is not allowed in this project. Use it or remove it.\n");
    Err(error_msg.into())
}
