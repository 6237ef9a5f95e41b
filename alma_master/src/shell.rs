//! Operator command grammar.
//!
//! Line-oriented, case-sensitive ASCII. Supervisory commands (`CT…`,
//! `CB…`, `EM2`, `PR…`) use decimal fields; the bring-up primitives
//! (`rsdo#`, `wsdo#`, …) keep their historical hex fields.

use alma_common::{EventKind, NodeId};

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// `load#<lib>,<bus>,<baud>,<nodeid>`
    Load {
        library: String,
        bus: String,
        baud: String,
        node: u8,
    },
    /// `CT0 M<n>`: discover and expect `n` motors.
    Discover { expected: usize },
    /// `CT1 M<n> P<p> VM<v> AM<a> [1]`
    MoveTo {
        node: NodeId,
        position: i32,
        velocity: u32,
        acceleration: u32,
        start: bool,
    },
    /// `CT2 P1`
    Homing,
    /// `CT2 P2`
    Recenter,
    /// `CT2 P3`
    Release,
    /// `CT4`
    Simulate,
    /// `CT5`
    StopSimulation,
    /// `CT6`
    Quit,
    /// `EM2`
    Emergency,
    /// `CB3`
    JoystickAttach,
    /// `CB4`
    FreeMoveStart,
    /// `CB5`
    FreeMoveStop,
    /// `CB7`
    FreeMoveStream,
    /// `PR1`
    PrintState,
    /// `PR5 M<n> O<idx> S<sub> T<bits><U|S> <value>`
    OdWrite {
        node: NodeId,
        index: u16,
        sub: u8,
        size: u8,
        value: u32,
    },
    /// `rsdo#node,index,sub`
    ReadSdo { node: NodeId, index: u16, sub: u8 },
    /// `wsdo#node,index,sub,size,value`
    WriteSdo {
        node: NodeId,
        index: u16,
        sub: u8,
        size: u8,
        value: u32,
    },
    /// `sraw#node,report_flag,command`
    RawCommand {
        node: NodeId,
        report: bool,
        command: String,
    },
    /// `shom#node,offset,vf,vb`
    HomingDirect {
        node: NodeId,
        offset: i32,
        forward_velocity: u32,
        backward_velocity: u32,
    },
    /// `shrt#node,period_ms`
    HeartStart { node: NodeId, period_ms: u16 },
    /// `svel#node`
    VelocityGet { node: NodeId },
    /// `sVTS#node,vt`
    VelocitySet { node: NodeId, velocity: u32 },
    /// `sacc#node`
    AccelerationGet { node: NodeId },
    /// `sfol#node`
    FollowingErrorGet { node: NodeId },
    /// `szer#node`
    ZeroReturn { node: NodeId },
    /// `simu#node`
    SimulateDirect { node: NodeId },
    /// `fake`
    Fake,
    /// `verb`
    Verbose,
    /// `help`
    Help,
}

/// Parse failure with the command echo the `CERR` line should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellParseError {
    pub echo: String,
    pub kind: EventKind,
}

impl ShellParseError {
    fn not_found(echo: &str) -> Self {
        Self {
            echo: echo.to_string(),
            kind: EventKind::NotFound,
        }
    }

    fn param(echo: &str) -> Self {
        Self {
            echo: echo.to_string(),
            kind: EventKind::ParamError,
        }
    }
}

/// Echo token used in reject replies: the command word alone.
fn echo_of(line: &str) -> &str {
    let token = line.split_whitespace().next().unwrap_or(line);
    token.split('#').next().unwrap_or(token)
}

fn tagged<'a>(token: Option<&'a str>, tag: &str) -> Option<&'a str> {
    token?.strip_prefix(tag)
}

fn dec<T: std::str::FromStr>(text: &str) -> Option<T> {
    text.parse().ok()
}

fn hex_u32(text: &str) -> Option<u32> {
    u32::from_str_radix(text, 16).ok()
}

/// Parse one operator line.
pub fn parse_command(line: &str) -> Result<ShellCommand, ShellParseError> {
    let line = line.trim();
    let echo = echo_of(line);

    if let Some(rest) = line.strip_prefix("load#") {
        let fields: Vec<&str> = rest.split(',').collect();
        if let [library, bus, baud, node] = fields[..] {
            if let Some(node) = dec::<u8>(node) {
                return Ok(ShellCommand::Load {
                    library: library.to_string(),
                    bus: bus.to_string(),
                    baud: baud.to_string(),
                    node,
                });
            }
        }
        return Err(ShellParseError::param(echo));
    }

    let mut fields = line.split_whitespace();
    let head = fields.next().unwrap_or("");
    match head {
        "CT0" => {
            let expected = tagged(fields.next(), "M")
                .and_then(dec::<usize>)
                .ok_or_else(|| ShellParseError::param(echo))?;
            Ok(ShellCommand::Discover { expected })
        }
        "CT1" => {
            let node = tagged(fields.next(), "M").and_then(dec::<NodeId>);
            let position = tagged(fields.next(), "P").and_then(dec::<i32>);
            let velocity = tagged(fields.next(), "VM").and_then(dec::<u32>);
            let acceleration = tagged(fields.next(), "AM").and_then(dec::<u32>);
            match (node, position, velocity, acceleration) {
                (Some(node), Some(position), Some(velocity), Some(acceleration)) => {
                    let start =
                        matches!(fields.next(), Some(f) if f.parse::<u32>().map_or(false, |v| v > 0));
                    Ok(ShellCommand::MoveTo {
                        node,
                        position,
                        velocity,
                        acceleration,
                        start,
                    })
                }
                _ => Err(ShellParseError::param(echo)),
            }
        }
        "CT2" => match fields.next() {
            Some("P1") => Ok(ShellCommand::Homing),
            Some("P2") => Ok(ShellCommand::Recenter),
            Some("P3") => Ok(ShellCommand::Release),
            _ => Err(ShellParseError::param(echo)),
        },
        "CT4" => Ok(ShellCommand::Simulate),
        "CT5" => Ok(ShellCommand::StopSimulation),
        "CT6" => Ok(ShellCommand::Quit),
        "EM2" => Ok(ShellCommand::Emergency),
        "CB3" => Ok(ShellCommand::JoystickAttach),
        "CB4" => Ok(ShellCommand::FreeMoveStart),
        "CB5" => Ok(ShellCommand::FreeMoveStop),
        "CB7" => Ok(ShellCommand::FreeMoveStream),
        "PR1" => Ok(ShellCommand::PrintState),
        "PR5" => {
            let node = tagged(fields.next(), "M").and_then(dec::<NodeId>);
            let index = tagged(fields.next(), "O").and_then(hex_u32);
            let sub = tagged(fields.next(), "S").and_then(dec::<u8>);
            let type_field = tagged(fields.next(), "T");
            let value = fields.next().and_then(hex_u32);
            let bits = type_field.and_then(|t| {
                let digits = t.trim_end_matches(['U', 'S']);
                if digits.len() == t.len() {
                    return None; // missing signedness tag
                }
                dec::<u8>(digits)
            });
            match (node, index, sub, bits, value) {
                (Some(node), Some(index), Some(sub), Some(bits), Some(value))
                    if bits % 8 == 0 && bits <= 32 =>
                {
                    Ok(ShellCommand::OdWrite {
                        node,
                        index: index as u16,
                        sub,
                        size: bits / 8,
                        value,
                    })
                }
                _ => Err(ShellParseError::param(echo)),
            }
        }
        _ => parse_primitive(line, echo),
    }
}

/// Bring-up primitives: `<name>#<hex fields,...>`.
fn parse_primitive(line: &str, echo: &str) -> Result<ShellCommand, ShellParseError> {
    match line {
        "fake" => return Ok(ShellCommand::Fake),
        "verb" => return Ok(ShellCommand::Verbose),
        "help" => return Ok(ShellCommand::Help),
        "quit" => return Ok(ShellCommand::Quit),
        _ => {}
    }

    let (name, rest) = match line.split_once('#') {
        Some(parts) => parts,
        None => return Err(ShellParseError::not_found(echo)),
    };
    let fields: Vec<&str> = rest.split(',').collect();
    let node = fields
        .first()
        .and_then(|f| hex_u32(f))
        .filter(|&n| n <= 127)
        .map(|n| n as NodeId);

    match (name, node) {
        ("rsdo", Some(node)) => {
            if let [_, index, sub] = fields[..] {
                if let (Some(index), Some(sub)) = (hex_u32(index), hex_u32(sub)) {
                    return Ok(ShellCommand::ReadSdo {
                        node,
                        index: index as u16,
                        sub: sub as u8,
                    });
                }
            }
            Err(ShellParseError::param(echo))
        }
        ("wsdo", Some(node)) => {
            if let [_, index, sub, size, value] = fields[..] {
                if let (Some(index), Some(sub), Some(size), Some(value)) =
                    (hex_u32(index), hex_u32(sub), hex_u32(size), hex_u32(value))
                {
                    return Ok(ShellCommand::WriteSdo {
                        node,
                        index: index as u16,
                        sub: sub as u8,
                        size: size as u8,
                        value,
                    });
                }
            }
            Err(ShellParseError::param(echo))
        }
        ("sraw", Some(node)) => {
            if fields.len() >= 3 {
                let report = fields[1] == "1";
                return Ok(ShellCommand::RawCommand {
                    node,
                    report,
                    command: fields[2..].join(","),
                });
            }
            Err(ShellParseError::param(echo))
        }
        ("shom", Some(node)) => {
            if let [_, offset, vf, vb] = fields[..] {
                if let (Some(offset), Some(vf), Some(vb)) =
                    (hex_u32(offset), hex_u32(vf), hex_u32(vb))
                {
                    return Ok(ShellCommand::HomingDirect {
                        node,
                        offset: offset as i32,
                        forward_velocity: vf,
                        backward_velocity: vb,
                    });
                }
            }
            Err(ShellParseError::param(echo))
        }
        ("shrt", Some(node)) => {
            if let [_, period] = fields[..] {
                if let Some(period) = hex_u32(period) {
                    return Ok(ShellCommand::HeartStart {
                        node,
                        period_ms: period as u16,
                    });
                }
            }
            Err(ShellParseError::param(echo))
        }
        ("svel", Some(node)) => Ok(ShellCommand::VelocityGet { node }),
        ("sVTS", Some(node)) => {
            if let [_, velocity] = fields[..] {
                if let Some(velocity) = hex_u32(velocity) {
                    return Ok(ShellCommand::VelocitySet { node, velocity });
                }
            }
            Err(ShellParseError::param(echo))
        }
        ("sacc", Some(node)) => Ok(ShellCommand::AccelerationGet { node }),
        ("sfol", Some(node)) => Ok(ShellCommand::FollowingErrorGet { node }),
        ("szer", Some(node)) => Ok(ShellCommand::ZeroReturn { node }),
        ("simu", Some(node)) => Ok(ShellCommand::SimulateDirect { node }),
        ("rsdo" | "wsdo" | "sraw" | "shom" | "shrt" | "svel" | "sVTS" | "sacc" | "sfol"
        | "szer" | "simu", None) => Err(ShellParseError::param(echo)),
        _ => Err(ShellParseError::not_found(echo)),
    }
}

/// Command summary printed by `help`.
pub const HELP_TEXT: &str = "\
   MANDATORY COMMAND:
     load#CanLibraryPath,channel,baudrate,nodeid
       ex: load#libcanfestival_can_socket.so,0,1M,8

   OPTIONAL COMMAND:
     fake : run with simulated motors
     verb : activate debug messages

   SERVO FLEET:
     CT0 M<num> : discover nodes, expecting num motors
     CT1 M<num> P<pos> VM<vel> AM<acc> [1] : point-to-point move
     CT2 P1 : homing for all motors (parameters from the motion tables)
     CT2 P2 : return all motors to the center point
     CT2 P3 : release motors with brake engaged
     CT4 : start simulation from the motion tables
     CT5 : stop simulation
     CT6 : quit application
     CB3 : attach the streaming position source
     CB4 / CB7 : start free movement by streaming
     CB5 : stop free movement
     EM2 : emergency stop of all motors
     PR1 : report supervisor state
     PR5 M<mot> O<index_hex> S<sub> T<bits><U|S> <value_hex> : write an object

   BRING-UP (all numbers hex):
     rsdo#nodeid,index,subindex : read sdo
     wsdo#nodeid,index,subindex,size,data : write sdo
     sraw#nodeid,report_flag,command : raw command to the drive
     shom#nodeid,offset,vel_forw,vel_back : start homing for one node
     shrt#nodeid,cycle : set heartbeat period [ms]
     svel#nodeid : read profile velocity
     sVTS#nodeid,VT : set profile velocity
     sacc#nodeid : read acceleration
     sfol#nodeid : read following error window
     szer#nodeid : move the motor to the origin
     simu#nodeid : start simulation for one node

     help : display this menu
     quit : quit application
";
