//! `card-sim` provisions a simulated identification token and drives it over hex-encoded APDUs.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use idtoken::{
    IdentificationToken, ProvisioningRecord, ResponseApdu, StatusWord, Terminal, TokenConfig,
    IDENTIFIER_BYTES, INS_SELECT, KEY_BYTES, PROVISIONING_BYTES,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

/// Card simulator command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "CARD_SIM_LOG_LEVEL")]
    log_level: Option<String>,
    /// Provisioning material for the simulated token.
    #[command(flatten)]
    provisioning: ProvisioningCli,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a fresh random provisioning block (pre-shared key followed by identifier).
    Params,
    /// Answer hex command APDUs read line by line from stdin.
    Serve,
    /// Run a full terminal exchange against a simulated token.
    Demo,
}

/// Provisioning flags.
#[derive(Args, Debug, Clone)]
struct ProvisioningCli {
    #[arg(
        long,
        env = "CARD_SIM_PSK",
        value_name = "HEX",
        help = "Pre-shared AES-128 key (16 bytes, hex)"
    )]
    psk: Option<String>,
    #[arg(
        long,
        env = "CARD_SIM_ID",
        value_name = "HEX",
        help = "Identifier disclosed to authenticated terminals (16 bytes, hex)"
    )]
    id: Option<String>,
    #[arg(
        long,
        env = "CARD_SIM_INSTALL_DATA",
        value_name = "HEX",
        conflicts_with_all = ["psk", "id"],
        help = "Installer parameter envelope carrying the provisioning block (hex)"
    )]
    install_data: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .as_deref()
        .map(|lvl| lvl.to_ascii_uppercase())
        .map(|lvl| match lvl.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "WARN" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or_else(|| match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Params => print_params(),
        Commands::Serve => serve(
            load_record(&cli.provisioning)?,
            io::stdin().lock(),
            io::stdout().lock(),
        ),
        Commands::Demo => demo(load_record(&cli.provisioning)?),
    }
}

fn decode_hex(label: &str, value: &str) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    let compact: String = value.split_whitespace().collect();
    let bytes = hex::decode(compact).with_context(|| format!("{label} is not valid hex"))?;
    Ok(Zeroizing::new(bytes))
}

fn load_record(cli: &ProvisioningCli) -> anyhow::Result<ProvisioningRecord> {
    if let Some(install) = cli.install_data.as_deref() {
        let install = decode_hex("install data", install)?;
        return ProvisioningRecord::from_install_data(&install)
            .context("install data does not carry a provisioning block");
    }

    let psk = cli
        .psk
        .as_deref()
        .context("either --psk with --id or --install-data is required")?;
    let id = cli.id.as_deref().context("--id is required with --psk")?;
    let psk = decode_hex("psk", psk)?;
    let id = decode_hex("id", id)?;
    if psk.len() != KEY_BYTES {
        bail!("psk must be {KEY_BYTES} bytes, got {}", psk.len());
    }
    if id.len() != IDENTIFIER_BYTES {
        bail!("id must be {IDENTIFIER_BYTES} bytes, got {}", id.len());
    }

    let mut params = Zeroizing::new(Vec::with_capacity(PROVISIONING_BYTES));
    params.extend_from_slice(&psk);
    params.extend_from_slice(&id);
    ProvisioningRecord::from_params(&params).context("provisioning rejected")
}

fn print_params() -> anyhow::Result<()> {
    let mut block = Zeroizing::new([0u8; PROVISIONING_BYTES]);
    OsRng
        .try_fill_bytes(&mut block[..])
        .context("OS entropy source unavailable")?;
    println!("{}", hex::encode_upper(&block[..]));
    Ok(())
}

fn is_select(line: &str, bytes: Option<&[u8]>) -> bool {
    line.eq_ignore_ascii_case("select")
        || matches!(bytes, Some([_, ins, _, _, ..]) if *ins == INS_SELECT)
}

fn serve(
    record: ProvisioningRecord,
    input: impl BufRead,
    mut output: impl Write,
) -> anyhow::Result<()> {
    let mut token = IdentificationToken::new(record, TokenConfig::default(), OsRng)
        .context("token configuration rejected")?;
    info!("token provisioned; reading command APDUs");

    for line in input.lines() {
        let line = line.context("reading command line")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let compact: String = line.split_whitespace().collect();
        let bytes = hex::decode(&compact).ok();
        let response = if is_select(line, bytes.as_deref()) {
            token.on_session_start();
            info!("transport session restarted");
            ResponseApdu::success(Vec::new())
        } else if let Some(bytes) = bytes {
            let response = token.process_apdu(&bytes);
            debug!(status = %response.status, "command processed");
            response
        } else {
            warn!("ignoring line that is not hex");
            ResponseApdu::error(StatusWord::UNKNOWN)
        };

        writeln!(output, "{}", hex::encode_upper(response.to_bytes()))?;
        output.flush()?;
    }
    info!("input closed; shutting down");
    Ok(())
}

fn demo(record: ProvisioningRecord) -> anyhow::Result<()> {
    let psk = record.psk().clone();
    let mut token = IdentificationToken::new(record, TokenConfig::default(), OsRng)
        .context("token configuration rejected")?;
    token.on_session_start();

    let mut terminal = Terminal::new(psk, OsRng);
    let identifier = terminal
        .identify(&mut token)
        .context("identification failed")?;
    info!("terminal authenticated; identifier disclosed");
    println!("{}", hex::encode_upper(identifier.expose()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_recognized_by_keyword_or_instruction() {
        assert!(is_select("SELECT", None));
        assert!(is_select("00a40400", Some(&[0x00, 0xA4, 0x04, 0x00])));
        assert!(!is_select("8010000010", Some(&[0x80, 0x10, 0x00, 0x00, 0x10])));
        assert!(!is_select("a4", Some(&[0xA4])));
    }

    #[test]
    fn psk_and_id_flags_provision_token() {
        let cli = ProvisioningCli {
            psk: Some("00112233445566778899AABBCCDDEEFF".into()),
            id: Some("00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 01".into()),
            install_data: None,
        };
        let record = load_record(&cli).unwrap();
        assert_eq!(record.identifier().expose()[15], 0x01);
    }

    #[test]
    fn install_data_flag_provisions_token() {
        let cli = ProvisioningCli {
            psk: None,
            id: None,
            install_data: Some(format!("000020{}", "11".repeat(PROVISIONING_BYTES))),
        };
        let record = load_record(&cli).unwrap();
        assert_eq!(record.identifier().expose(), &[0x11; IDENTIFIER_BYTES]);
    }

    #[test]
    fn malformed_flags_are_rejected() {
        let missing = ProvisioningCli {
            psk: None,
            id: None,
            install_data: None,
        };
        assert!(load_record(&missing).is_err());

        let short = ProvisioningCli {
            psk: Some("0011".into()),
            id: Some("00".repeat(IDENTIFIER_BYTES)),
            install_data: None,
        };
        assert!(load_record(&short).is_err());

        let not_hex = ProvisioningCli {
            psk: Some("zz".repeat(KEY_BYTES)),
            id: Some("00".repeat(IDENTIFIER_BYTES)),
            install_data: None,
        };
        assert!(load_record(&not_hex).is_err());
    }

    #[test]
    fn serve_restarts_session_on_select() {
        let record = ProvisioningRecord::from_params(&[0x5Cu8; PROVISIONING_BYTES]).unwrap();
        let auth = format!("8011000010{}10", "00".repeat(16));
        let input = format!(
            "8010000010\nselect\n# comment\n\n8012000010\n{auth}\n00 A4 04 00 00\nnot hex\n"
        );
        let mut output = Vec::new();
        serve(record, input.as_bytes(), &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0].len(), 2 * (16 + 2));
        assert!(lines[0].ends_with("9000"));
        assert_eq!(lines[1], "9000");
        assert_eq!(lines[2], "6985");
        assert_eq!(lines[3], "6985");
        assert_eq!(lines[4], "9000");
        assert_eq!(lines[5], "6F00");
    }

    #[test]
    fn demo_succeeds_with_generated_material() {
        let record = ProvisioningRecord::from_params(&[0x5Cu8; PROVISIONING_BYTES]).unwrap();
        demo(record).unwrap();
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "card-sim",
            "-vv",
            "--psk",
            "00112233445566778899AABBCCDDEEFF",
            "--id",
            "00000000000000000000000000000001",
            "demo",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Demo));
    }
}
