use clap::Subcommand;
use spectre::{Capture, Resource, Spectre};

use super::Output;

#[derive(Debug, Clone, Subcommand)]
pub enum ResourcesAction {
    /// List all resources.
    List,

    /// Show one resource definition.
    Show { name: String },

    /// Captures matching a resource, oldest first.
    Captures {
        name: String,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Most recent capture of a resource, with its body.
    Latest { name: String },

    /// Captures of a resource, newest first.
    History {
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Delete a resource definition. Captures are kept.
    Remove { name: String },
}

pub fn resources(spectre: &Spectre, action: &ResourcesAction, out: Output) -> anyhow::Result<()> {
    let store = spectre.resources();
    match action {
        ResourcesAction::List => {
            let all = store.list()?;
            out.emit(&all, |all| {
                if all.is_empty() {
                    println!("No resources.");
                    return;
                }
                for r in all {
                    print_resource_line(r);
                }
            })
        }
        ResourcesAction::Show { name } => {
            let resource = store.get(name)?;
            out.emit(&resource, |r| {
                println!("Name:        {}", r.name);
                println!("Pattern:     {}", r.pattern);
                println!("Method:      {}", r.method);
                println!("Source:      {}", r.source.as_str());
                println!("Samples:     {}", r.sample_count);
                println!("Primary key: {}", r.primary_key.as_deref().unwrap_or("-"));
                println!("Created:     {}", r.created_at.to_rfc3339());
                println!("Updated:     {}", r.updated_at.to_rfc3339());
            })
        }
        ResourcesAction::Captures { name, limit } => {
            let resource = store.get(name)?;
            let captures = store.matching_captures(&resource, *limit)?;
            out.emit(&captures, |c| print_captures(c))
        }
        ResourcesAction::Latest { name } => {
            let resource = store.get(name)?;
            let capture = store.latest_capture(&resource)?;
            let body = match &capture.blob_digest {
                Some(digest) => Some(spectre.content().get_json(digest)?),
                None => None,
            };
            let latest = serde_json::json!({ "capture": capture, "body": body });
            out.emit(&latest, |_| {
                print_captures(std::slice::from_ref(&capture));
                if let Some(body) = &body {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(body).unwrap_or_default()
                    );
                }
            })
        }
        ResourcesAction::History {
            name,
            offset,
            limit,
        } => {
            let resource = store.get(name)?;
            let captures = store.history(&resource, *offset, *limit)?;
            out.emit(&captures, |c| print_captures(c))
        }
        ResourcesAction::Remove { name } => {
            let removed = store.remove(name)?;
            out.emit(&removed, |r| println!("Removed resource {}", r.name))
        }
    }
}

fn print_resource_line(r: &Resource) {
    println!(
        "{:<24} {:<7} {:<9} {:>6}  {}",
        r.name,
        r.method,
        r.source.as_str(),
        r.sample_count,
        r.pattern
    );
}

fn print_captures(captures: &[Capture]) {
    if captures.is_empty() {
        println!("No captures.");
        return;
    }
    for c in captures {
        println!(
            "{}  {:<7} {}  {}  {}",
            c.timestamp.format("%Y-%m-%d %H:%M:%S"),
            c.method,
            c.status,
            c.blob_digest.as_ref().map_or("--------", |d| d.short()),
            c.raw_url
        );
    }
}
