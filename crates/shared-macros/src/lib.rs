extern crate proc_macro;

use std::{collections::BTreeMap, fs, path::Path};

use proc_macro::TokenStream;
use quote::quote;
use syn::{LitStr, parse_macro_input};

const SUPPORTED_BACKENDS: &[&str] = &["sqlite"];

/// Embeds every `*.sql` file of a migrations directory (relative to the calling
/// crate's manifest) as a `Migrations` map keyed by backend, then file name.
///
/// Files named `<name>.<backend>.<up|down>.sql` are registered for that backend
/// only. Files without a backend segment are registered for every supported
/// backend.
#[proc_macro]
pub fn load_sql_migrations(input: TokenStream) -> TokenStream {
    let path_lit = parse_macro_input!(input as LitStr);

    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => {
            return syn::Error::new(path_lit.span(), "CARGO_MANIFEST_DIR not set")
                .to_compile_error()
                .into();
        }
    };
    let migrations_path = Path::new(&manifest_dir).join(path_lit.value());

    let entries = match fs::read_dir(&migrations_path) {
        Ok(entries) => entries,
        Err(e) => {
            let msg = format!(
                "failed to read migrations directory {}: {e}",
                migrations_path.display()
            );
            return syn::Error::new(path_lit.span(), msg)
                .to_compile_error()
                .into();
        }
    };

    let mut backend_map = BTreeMap::<&str, BTreeMap<String, String>>::new();

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                let msg = format!("failed to read migration file {file_name}: {e}");
                return syn::Error::new(path_lit.span(), msg)
                    .to_compile_error()
                    .into();
            }
        };

        let matched_backend = SUPPORTED_BACKENDS
            .iter()
            .find(|backend| file_name.contains(&format!(".{backend}.")));

        let targets: Vec<&str> = match matched_backend {
            Some(backend) => vec![*backend],
            None => SUPPORTED_BACKENDS.to_vec(),
        };

        for backend in targets {
            backend_map
                .entry(backend)
                .or_default()
                .insert(file_name.to_string(), contents.clone());
        }
    }

    let backend_tokens = backend_map.iter().map(|(backend, files)| {
        let file_tokens = files.iter().map(|(name, contents)| {
            quote! {
                map.insert(#name, #contents);
            }
        });

        quote! {
            {
                let mut map = ::std::collections::BTreeMap::new();
                #(#file_tokens)*
                migrations.insert(#backend, map);
            }
        }
    });

    // include_bytes! on each file so cargo rebuilds when a migration changes
    let tracked_files = backend_map
        .values()
        .flat_map(|files| files.keys())
        .map(|name| migrations_path.join(name).to_string_lossy().to_string())
        .collect::<std::collections::BTreeSet<_>>();
    let tracking_tokens = tracked_files.iter().map(|file| {
        quote! {
            const _: &[u8] = include_bytes!(#file);
        }
    });

    let expanded = quote! {
        {
            #(#tracking_tokens)*
            let mut migrations = ::std::collections::BTreeMap::new();
            #(#backend_tokens)*
            migrations
        }
    };

    TokenStream::from(expanded)
}
