use std::path::Path;

use clap::{
    crate_description, crate_name, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand,
};

use mpkg::core::Compression;
use mpkg::{Config, DbBackend, EmitOpts, PkgVersion};

fn config_from(matches: &ArgMatches) -> Config {
    let mut cfg = Config::default();
    if let Some(dir) = matches.value_of("instroot") {
        cfg.inst_root = dir.into();
    }
    if let Some(dir) = matches.value_of("pkgdir") {
        cfg.pkg_dir = dir.into();
    }
    if let Some(dir) = matches.value_of("tempdir") {
        cfg.temp_dir = dir.into();
    }
    if matches.is_present("disable-md5") {
        cfg.check_md5 = false;
    }
    cfg
}

fn pkg_name_from_output(output: &str) -> String {
    let base = Path::new(output)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| output.to_string());
    for suffix in [".tar.bz2", ".tar.gz", ".tar", ".mpkg", ".pkg"] {
        if let Some(stem) = base.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    base
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let arg_instroot = Arg::with_name("instroot")
        .help("Directory to realize package paths under (defaults to '/')")
        .long("instroot")
        .takes_value(true)
        .value_name("DIR")
        .global(true);

    let arg_pkgdir = Arg::with_name("pkgdir")
        .help("Directory holding descriptions and the package database (defaults to '/var/pkg')")
        .long("pkgdir")
        .takes_value(true)
        .value_name("DIR")
        .global(true);

    let arg_tempdir = Arg::with_name("tempdir")
        .help("Parent directory for scratch space")
        .long("tempdir")
        .takes_value(true)
        .value_name("DIR")
        .global(true);

    let arg_no_md5 = Arg::with_name("disable-md5")
        .help("Skip MD5 verification when unpacking packages")
        .long("disable-md5")
        .global(true);

    let matches = App::new(crate_name!())
        .about(crate_description!())
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(arg_instroot)
        .arg(arg_pkgdir)
        .arg(arg_tempdir)
        .arg(arg_no_md5)
        .subcommand(
            SubCommand::with_name("install")
                .about("Install package files")
                .arg(
                    Arg::with_name("package")
                        .help("Package file(s)")
                        .required(true)
                        .multiple(true)
                        .value_name("FILE"),
                ),
        )
        .subcommand(
            SubCommand::with_name("remove")
                .about("Remove installed packages")
                .arg(
                    Arg::with_name("name")
                        .help("Installed package name(s)")
                        .required(true)
                        .multiple(true)
                        .value_name("NAME"),
                ),
        )
        .subcommand(
            SubCommand::with_name("create")
                .about("Build a package file from a directory tree")
                .arg(
                    Arg::with_name("dir")
                        .help("Directory to package")
                        .required(true)
                        .value_name("DIR"),
                )
                .arg(
                    Arg::with_name("output")
                        .help("Package file to write")
                        .required(true)
                        .value_name("FILE"),
                )
                .arg(
                    Arg::with_name("name")
                        .help("Package name (defaults to the output file stem)")
                        .long("set-name")
                        .takes_value(true)
                        .value_name("NAME"),
                )
                .arg(
                    Arg::with_name("compression")
                        .help("Compression for the archive")
                        .long("set-compression")
                        .takes_value(true)
                        .possible_values(&["none", "gzip", "bzip2"]),
                )
                .arg(
                    Arg::with_name("version")
                        .help("Package format version")
                        .long("set-version")
                        .takes_value(true)
                        .possible_values(&["1", "2"]),
                )
                .arg(
                    Arg::with_name("enable-dirs")
                        .help("Record directory entries in the description")
                        .long("enable-dirs"),
                )
                .arg(
                    Arg::with_name("disable-files")
                        .help("Leave regular files out of the package")
                        .long("disable-files"),
                )
                .arg(
                    Arg::with_name("disable-symlinks")
                        .help("Leave symlinks out of the package")
                        .long("disable-symlinks"),
                ),
        )
        .subcommand(
            SubCommand::with_name("createdb")
                .about("Create an empty package database")
                .arg(
                    Arg::with_name("type")
                        .help("Database backend")
                        .possible_values(&["text", "sled"])
                        .default_value("text"),
                ),
        )
        .subcommand(SubCommand::with_name("dumpdb").about("Print the package database"))
        .get_matches();

    if let Some(sub) = matches.subcommand_matches("install") {
        let cfg = config_from(sub);
        let packages: Vec<&str> = sub.values_of("package").map(Iterator::collect).unwrap_or_default();
        mpkg::install(&cfg, &packages)?;
    } else if let Some(sub) = matches.subcommand_matches("remove") {
        let cfg = config_from(sub);
        let names: Vec<&str> = sub.values_of("name").map(Iterator::collect).unwrap_or_default();
        mpkg::remove(&cfg, &names)?;
    } else if let Some(sub) = matches.subcommand_matches("create") {
        let cfg = config_from(sub);
        let dir = sub.value_of("dir").unwrap();
        let output = sub.value_of("output").unwrap();

        let mut opts = EmitOpts::default().guess_from_name(output);
        match sub.value_of("compression") {
            Some("none") => opts.compression = Compression::None,
            Some("gzip") => opts.compression = Compression::Gzip,
            Some("bzip2") => opts.compression = Compression::Bzip2,
            _ => {}
        }
        match sub.value_of("version") {
            Some("1") => opts.version = PkgVersion::V1,
            Some("2") => opts.version = PkgVersion::V2,
            _ => {}
        }
        if sub.is_present("enable-dirs") {
            opts.include_dirs = true;
        }
        if sub.is_present("disable-files") {
            opts.include_files = false;
        }
        if sub.is_present("disable-symlinks") {
            opts.include_symlinks = false;
        }

        let name = sub
            .value_of("name")
            .map(str::to_string)
            .unwrap_or_else(|| pkg_name_from_output(output));
        mpkg::create(&cfg, &name, dir, output, &opts)?;
    } else if let Some(sub) = matches.subcommand_matches("createdb") {
        let cfg = config_from(sub);
        let backend = match sub.value_of("type") {
            Some("sled") => DbBackend::Sled,
            _ => DbBackend::Text,
        };
        mpkg::createdb(&cfg, backend)?;
    } else if let Some(sub) = matches.subcommand_matches("dumpdb") {
        let cfg = config_from(sub);
        mpkg::dumpdb(&cfg)?;
    }

    Ok(())
}
