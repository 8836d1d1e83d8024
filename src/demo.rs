//! Demo content: a short quest line and a small world map.
//!
//! Each system gets one instance named after the system, so command-line
//! inputs are addressed as `<system>:<input>`.

use arbor_core::{Action, CompareOp, Condition, Controller, CoreError, LogLevel, Node, NodeKind, Scope, Transition};

pub const QUEST_SYSTEM: &str = "WolfQuest";
pub const WORLD_SYSTEM: &str = "WorldSystem";

/// Gold paid out when the quest is turned in.
pub const QUEST_REWARD: i64 = 25;

/// Authors both systems into the controller's content.
pub fn build(controller: &mut Controller) -> Result<(), CoreError> {
    build_quest(controller)?;
    build_world(controller)?;
    Ok(())
}

/// Creates one instance per demo system.
pub fn spawn_instances(controller: &mut Controller) -> Result<(), CoreError> {
    for system in [QUEST_SYSTEM, WORLD_SYSTEM] {
        if controller.instance(system).is_none() {
            controller.try_create_instance(system, system)?;
        }
    }
    Ok(())
}

fn build_quest(controller: &mut Controller) -> Result<(), CoreError> {
    let content = controller.content_mut();

    let root = content.add_node(Node::new(QUEST_SYSTEM, NodeKind::Root));
    let offered = content.add_node(
        Node::new("Offered", NodeKind::Dialogue)
            .on_enter(Action::log("The elder asks for help with the wolves", LogLevel::Info)),
    );
    let hunt = content.add_node(
        Node::new(
            "WolfHunt",
            NodeKind::Quest {
                objectives: vec!["wolves".to_string(), "pelts".to_string()],
            },
        )
        .on_enter(Action::set_quest_status("WolfHunt", "active")),
    );
    let den = content.add_node(
        Node::new("Den", NodeKind::Location)
            .on_enter(Action::complete_objective("WolfHunt", "wolves"))
            .on_exit(Action::complete_objective("WolfHunt", "pelts")),
    );
    let completed = content.add_node(
        Node::basic("Completed")
            .accepting()
            .on_enter(Action::set_quest_status("WolfHunt", "complete"))
            .on_enter(Action::modify_relationship("elder", 10))
            .on_enter(Action::add_to_variable(Scope::Global, "gold", QUEST_REWARD)),
    );

    content.add_child(root, offered)?;
    content.add_child(offered, hunt)?;
    content.add_child(hunt, den)?;
    content.add_child(hunt, completed)?;

    content.add_transition(root, Transition::new("talk", offered).when(Condition::input("talk")))?;
    content.add_transition(offered, Transition::new("accept", hunt).when(Condition::input("accept")))?;
    content.add_transition(offered, Transition::new("decline", root).when(Condition::input("decline")))?;
    content.add_transition(hunt, Transition::new("hunt", den).when(Condition::input("hunt")))?;
    content.add_transition(
        hunt,
        Transition::new("report", completed)
            .when(Condition::input("report"))
            .when(Condition::objective_complete("WolfHunt", "wolves"))
            .when(Condition::objective_complete("WolfHunt", "pelts")),
    )?;
    content.add_transition(den, Transition::new("return", hunt).when(Condition::input("return")))?;

    controller.register_system(QUEST_SYSTEM, root)
}

fn build_world(controller: &mut Controller) -> Result<(), CoreError> {
    let content = controller.content_mut();

    let root = content.add_node(Node::new(WORLD_SYSTEM, NodeKind::Root));
    let vale = content.add_node(Node::new("Vale", NodeKind::Region));
    let town = content.add_node(
        Node::new("Millbrook", NodeKind::Location)
            .with_state("population", 120)
            .on_enter(Action::add_to_variable(Scope::Local, "visits", 1)),
    );
    let tower = content.add_node(Node::new("Watchtower", NodeKind::Location));
    // Reached only through a transition; identified as WorldSystem/Cave.
    let cave = content.add_node(Node::new("Cave", NodeKind::Location));

    content.add_child(root, vale)?;
    content.add_child(vale, town)?;
    content.add_child(vale, tower)?;

    content.add_transition(root, Transition::new("travel", vale).when(Condition::input("travel")))?;
    content.add_transition(vale, Transition::new("walk", town).when(Condition::input("walk")))?;
    content.add_transition(
        town,
        Transition::new("climb", tower)
            .when(Condition::input("climb"))
            .when(Condition::expression(&format!("global.gold >= {}", QUEST_REWARD))?),
    )?;
    content.add_transition(town, Transition::new("explore", cave).when(Condition::input("explore")))?;
    content.add_transition(
        cave,
        Transition::new("leave", town)
            .when(Condition::input("leave"))
            .when(Condition::variable(Scope::Local, "visits", CompareOp::Ge, 1)),
    )?;
    content.add_transition(tower, Transition::new("descend", town).when(Condition::input("descend")))?;

    controller.register_system(WORLD_SYSTEM, root)
}
