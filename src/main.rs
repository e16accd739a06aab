use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use ipnet::Ipv4Net;
use mocker::run_container;
use mocker::ContainerExit;
use mocker::ContainerSpec;

#[derive(Parser)]
#[command(
    about = "Mocker — run a command in a minimal Linux container.",
    long_about = None,
)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a command in a new container.
    #[command(trailing_var_arg = true)]
    Run {
        /// Image reference. Recorded; the minimal runtime does not fetch
        /// images.
        image: String,
        /// Command to execute inside the container.
        program: String,
        /// Arguments for the command.
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
        /// Host-side veth interface name.
        #[arg(long, default_value = mocker::DEFAULT_HOST_VETH)]
        host_veth: String,
        /// Container-side veth interface name.
        #[arg(long, default_value = mocker::DEFAULT_CONTAINER_VETH)]
        container_veth: String,
        /// IPv4 address of the host end; the container's default gateway.
        #[arg(long, default_value = mocker::DEFAULT_HOST_IP)]
        host_ip: Ipv4Addr,
        /// IPv4 address of the container end.
        #[arg(long, default_value = mocker::DEFAULT_CONTAINER_IP)]
        container_ip: Ipv4Addr,
        /// Container network in CIDR notation; also the NAT source range.
        #[arg(long, default_value = mocker::DEFAULT_CONTAINER_NETWORK)]
        network: Ipv4Net,
        /// memory.max for the container, in bytes.
        #[arg(long, default_value_t = mocker::DEFAULT_MEMORY_MAX_BYTES)]
        memory_max: u64,
        /// cpu.max quota in microseconds per 100 ms period.
        #[arg(long, default_value_t = mocker::DEFAULT_CPU_MAX_PERIOD_US)]
        cpu_max: u32,
        /// Cgroup directory created for the container.
        #[arg(long, default_value = mocker::DEFAULT_CGROUP_PATH)]
        cgroup_path: PathBuf,
        /// Container root filesystem location.
        #[arg(long, default_value = mocker::DEFAULT_CONTAINER_ROOT)]
        container_root: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();
    let cli = match Args::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    match do_main(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn do_main(cli: Args) -> Result<ExitCode, mocker::Error> {
    match cli.command {
        Cmd::Run {
            image,
            program,
            args,
            host_veth,
            container_veth,
            host_ip,
            container_ip,
            network,
            memory_max,
            cpu_max,
            cgroup_path,
            container_root,
        } => {
            let mut command = Vec::with_capacity(args.len() + 1);
            command.push(program);
            command.extend(args);
            let mut spec = ContainerSpec::new(image, command);
            spec.host_veth = host_veth;
            spec.container_veth = container_veth;
            spec.host_ip = host_ip;
            spec.container_ip = container_ip;
            spec.prefix_len = network.prefix_len();
            spec.container_network = network;
            spec.memory_max_bytes = memory_max;
            spec.cpu_max_period_us = cpu_max;
            spec.cgroup_path = cgroup_path;
            spec.container_root = container_root;

            let exit = run_container(&spec)?;
            match exit {
                ContainerExit::Exited(code) => {
                    log::info!("Container exited with status {}", code);
                }
                ContainerExit::Signaled(signal) => {
                    eprintln!("Container killed by signal {}", signal);
                }
            }
            Ok(ExitCode::from(exit.code().clamp(0, 255) as u8))
        }
    }
}
