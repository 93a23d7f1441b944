use clap::Parser;
use relay_bus::DEFAULT_ROOM_CAPACITY;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "wave-road")]
#[command(about = "Room relay for wave signaling")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "WAVE_ROAD_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "WAVE_ROAD_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Participants per room
    #[arg(long, env = "WAVE_ROAD_ROOM_CAPACITY", default_value_t = DEFAULT_ROOM_CAPACITY)]
    pub room_capacity: usize,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from(["wave-road", "--port", "9001", "--room-capacity", "4"]);
        assert_eq!(config.port, 9001);
        assert_eq!(config.room_capacity, 4);
        assert_eq!(config.listen_addr(), format!("{}:9001", config.bind));
    }
}
