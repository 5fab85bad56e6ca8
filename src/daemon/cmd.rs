use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "libvirt-providerd")]
#[command(about = "libvirt machine provider daemon", long_about = None)]
pub struct Cli {
    /// Path to the config file. If not provided, the daemon will look for a config file in the
    /// current working directory (libvirt-provider.toml), in the home config dir or in the
    /// system config dir (/etc/libvirt-provider/config.toml)
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,
}
