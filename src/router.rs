/*!
    translation of bus commands into register writes

    a command addresses one motor, except `resend_config` which reloads the configuration from the backend store.
    Commands are fully validated before any register is touched, so a malformed command has no partial effect.
*/

use core::str::FromStr;
use log::*;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    };
use std::sync::Arc;

use crate::{
    link::RegisterClient,
    registers::{Motor, Control},
    store::ConfigStore,
    };


/// command message as received from the bus: `{"action": string, "motor": 1|2, "value": number}`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct CommandMessage {
    #[serde(default)]
    pub action: Option<Value>,
    #[serde(default)]
    pub motor: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// write the target position then start the move
    SetTarget,
    /// start a move toward the previously set target
    StartMove,
    StopMove,
    SetSpeed,
    SetAccel,
    /// start the homing sequence
    Home,
    /// fetch the configuration again and apply it
    ResendConfig,
}
impl Action {
    /// whether this action addresses a particular motor
    pub fn is_motor_scoped(self) -> bool {
        self != Action::ResendConfig
    }
    pub fn requires_value(self) -> bool {
        matches!(self, Action::SetTarget | Action::SetSpeed | Action::SetAccel)
    }
}
impl FromStr for Action {
    type Err = CommandError;
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(match name {
            "set_target" => Action::SetTarget,
            "start_move" => Action::StartMove,
            "stop_move" => Action::StopMove,
            "set_speed" => Action::SetSpeed,
            "set_accel" => Action::SetAccel,
            "home" => Action::Home,
            "resend_config" => Action::ResendConfig,
            other => return Err(CommandError::UnknownAction(other.to_owned())),
        })
    }
}

/// reason for dropping a command, no register I/O is attempted for these
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing action")]
    MissingAction,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("invalid motor {0}, expected 1 or 2")]
    InvalidMotor(String),
    #[error("missing motor for {0:?}")]
    MissingMotor(Action),
    #[error("missing value for {0:?}")]
    MissingValue(Action),
    #[error("value {0} is not an integer")]
    InvalidValue(String),
    #[error("value {value} out of range for {action:?}")]
    ValueOutOfRange { action: Action, value: i64 },
}

/// decoded command
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub action: Action,
    pub motor: Option<Motor>,
    pub value: Option<i64>,
}
impl Command {
    pub fn new(action: Action, motor: Option<Motor>, value: Option<i64>) -> Self {
        Self {action, motor, value}
    }
}
impl TryFrom<&CommandMessage> for Command {
    type Error = CommandError;
    fn try_from(message: &CommandMessage) -> Result<Self, Self::Error> {
        let action = match &message.action {
            None | Some(Value::Null) => return Err(CommandError::MissingAction),
            Some(Value::String(name)) => name.parse::<Action>()?,
            Some(other) => return Err(CommandError::UnknownAction(other.to_string())),
        };
        // fields an action does not use are ignored whatever their content
        let motor = match &message.motor {
            _ if !action.is_motor_scoped() => None,
            None | Some(Value::Null) => None,
            Some(value) => Some(integer(value)
                .and_then(|number| Motor::try_from(number).ok())
                .ok_or_else(|| CommandError::InvalidMotor(value.to_string()))?),
        };
        let value = match &message.value {
            _ if !action.requires_value() => None,
            None | Some(Value::Null) => None,
            Some(value) => Some(integer(value)
                .ok_or_else(|| CommandError::InvalidValue(value.to_string()))?),
        };
        Ok(Self {action, motor, value})
    }
}

/// integral JSON number, floats are accepted when they have no fractional part
pub(crate) fn integer(value: &Value) -> Option<i64> {
    let Value::Number(number) = value else {return None};
    if let Some(integer) = number.as_i64() {
        return Some(integer)
    }
    let float = number.as_f64()?;
    if float.fract() == 0.0 && float >= i64::MIN as f64 && float <= i64::MAX as f64 {
        Some(float as i64)
    }
    else {None}
}

/// register level operation a command resolves to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Plan {
    Target(Motor, i32),
    Control(Motor, Control),
    Speed(Motor, u16),
    Accel(Motor, u16),
    Reload,
}
impl Command {
    fn plan(&self) -> Result<Plan, CommandError> {
        let action = self.action;
        if !action.is_motor_scoped() {
            return Ok(Plan::Reload);
        }
        let motor = self.motor.ok_or(CommandError::MissingMotor(action))?;
        let value = match (action.requires_value(), self.value) {
            (true, None) => return Err(CommandError::MissingValue(action)),
            (_, value) => value.unwrap_or_default(),
        };
        let out_of_range = |_| CommandError::ValueOutOfRange {action, value};
        Ok(match action {
            Action::SetTarget => Plan::Target(motor, i32::try_from(value).map_err(out_of_range)?),
            Action::StartMove => Plan::Control(motor, Control::Start),
            Action::StopMove => Plan::Control(motor, Control::Stop),
            Action::Home => Plan::Control(motor, Control::Home),
            Action::SetSpeed => Plan::Speed(motor, u16::try_from(value).map_err(out_of_range)?),
            Action::SetAccel => Plan::Accel(motor, u16::try_from(value).map_err(out_of_range)?),
            Action::ResendConfig => Plan::Reload,
        })
    }
}


/// dispatcher of decoded commands to the board
pub struct CommandRouter<S, C> {
    client: Arc<RegisterClient<S>>,
    store: C,
}
impl<S, C> CommandRouter<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: ConfigStore,
{
    pub fn new(client: Arc<RegisterClient<S>>, store: C) -> Self {
        Self {client, store}
    }

    /**
        execute a command

        returns whether every register write succeeded, or the reason the command was dropped before any I/O.
        `set_target` issues two writes which are not atomic: if starting the move fails, the target stays set.
    */
    pub async fn dispatch(&self, command: &Command) -> Result<bool, CommandError> {
        let plan = command.plan()?;
        let client = &*self.client;
        Ok(match plan {
            Plan::Target(motor, position) => {
                let registers = motor.registers();
                if !client.write(registers.target, position).await {
                    warn!("failed to set motor {} target (register {:#04x})", motor.number(), registers.target.address());
                    return Ok(false)
                }
                info!("set motor {} target to {}", motor.number(), position);
                self.control(motor, Control::Start).await
            },
            Plan::Control(motor, code) => self.control(motor, code).await,
            Plan::Speed(motor, speed) => {
                let register = motor.registers().max_speed;
                let done = client.write(register, speed).await;
                if done {info!("set motor {} max speed to {}", motor.number(), speed)}
                else {warn!("failed to set motor {} max speed (register {:#04x})", motor.number(), register.address())}
                done
            },
            Plan::Accel(motor, accel) => {
                let register = motor.registers().acceleration;
                let done = client.write(register, accel).await;
                if done {info!("set motor {} acceleration to {}", motor.number(), accel)}
                else {warn!("failed to set motor {} acceleration (register {:#04x})", motor.number(), register.address())}
                done
            },
            Plan::Reload => self.reload().await,
        })
    }

    async fn control(&self, motor: Motor, code: Control) -> bool {
        let register = motor.registers().control;
        let done = self.client.write(register, code as u8).await;
        if done {info!("sent {:?} to motor {}", code, motor.number())}
        else {warn!("failed to send {:?} to motor {} (register {:#04x})", code, motor.number(), register.address())}
        done
    }

    async fn reload(&self) -> bool {
        info!("fetching configuration again");
        match self.store.fetch().await {
            Ok(document) => {
                document.apply(&*self.client).await;
                true
            },
            Err(error) => {
                warn!("cannot reload configuration: {}", error);
                false
            },
        }
    }

    /// decode and execute one bus message, malformed commands are logged and dropped
    pub async fn handle(&self, message: &CommandMessage) {
        info!("received command {:?}", message);
        let result = match Command::try_from(message) {
            Ok(command) => self.dispatch(&command).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            warn!("dropped command {:?}: {}", message, error);
        }
    }

    /// execute commands in arrival order until the channel closes
    pub async fn serve(&self, mut commands: mpsc::Receiver<CommandMessage>) {
        while let Some(message) = commands.recv().await {
            self.handle(&message).await;
        }
        debug!("command channel closed");
    }
}
