//! `tokenrelay id`: generate message ids or inspect one.

use clap::ArgMatches;
use tokenrelay_protocol::IdentityGenerator;

pub fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(id) = matches.get_one::<String>("inspect") {
        return inspect(id);
    }

    let count = matches.get_one::<usize>("count").copied().unwrap_or(1);
    let ids = IdentityGenerator::global();
    for _ in 0..count {
        println!("{}", ids.generate());
    }
    Ok(())
}

fn inspect(id: &str) -> anyhow::Result<()> {
    let Some(timestamp) = IdentityGenerator::extract_timestamp(id) else {
        anyhow::bail!("'{}' is not a generated message id", id);
    };

    let fingerprint = id.split('_').nth(3).unwrap_or_default();
    let sequence = id.split('_').nth(4).unwrap_or_default();
    println!("\x1b[32m\u{2713}\x1b[0m valid message id");
    println!("  timestamp:   {}", timestamp.to_rfc3339());
    println!("  fingerprint: {}", fingerprint);
    println!("  sequence:    {}", sequence);
    Ok(())
}
