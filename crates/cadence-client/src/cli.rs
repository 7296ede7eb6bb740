use cadence_models::Snowflake;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cadence", about = "Cadence gateway and voice client")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/cadence.toml")]
    pub config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Join a voice channel once ready, as `<guild>:<channel>`
    #[arg(long, value_parser = parse_join)]
    pub join: Option<(Snowflake, Snowflake)>,

    /// Raw 48 kHz stereo s16le PCM to play after joining: a file path or an http(s) URL
    #[arg(long, requires = "join")]
    pub play: Option<String>,
}

fn parse_join(raw: &str) -> Result<(Snowflake, Snowflake), String> {
    let (guild, channel) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <guild>:<channel>, got '{raw}'"))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<u64>()
            .map(Snowflake)
            .map_err(|e| format!("invalid id '{part}': {e}"))
    };
    Ok((parse(guild)?, parse(channel)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_target() {
        let args = Args::parse_from(["cadence", "--join", "10:20", "--play", "song.pcm"]);
        assert_eq!(args.join, Some((Snowflake(10), Snowflake(20))));
        assert_eq!(args.play.as_deref(), Some("song.pcm"));
        assert_eq!(args.config, "config/cadence.toml");
        assert!(!args.log_json);
    }

    #[test]
    fn rejects_bad_join_and_orphan_play() {
        assert!(Args::try_parse_from(["cadence", "--join", "10-20"]).is_err());
        assert!(Args::try_parse_from(["cadence", "--join", "x:20"]).is_err());
        assert!(Args::try_parse_from(["cadence", "--play", "a.pcm"]).is_err());
    }
}
