//! Logs a user in through a chain whose first step waits for a simulated server reply.

use std::cell::RefCell;
use std::rc::Rc;

use chain_relay::{
    ChainOutcome, EventBus, ObjectPool, Outcome, Poolable, Relay, Step, StepCompletion,
    StepContext,
};

#[derive(Default)]
struct LoginRequested {
    username: String,
}

impl Poolable for LoginRequested {
    fn reset(&mut self) {
        self.username.clear();
    }
}

type Pending = Rc<RefCell<Vec<(String, StepCompletion)>>>;

/// Hands the credentials to the "server" and waits for its answer.
struct Authenticate {
    username: String,
    pending: Pending,
}

impl Poolable for Authenticate {
    fn reset(&mut self) {
        self.username.clear();
    }
}

impl Step for Authenticate {
    fn execute(&mut self, context: StepContext) -> Outcome {
        println!("sending credentials for {}", self.username);
        self.pending
            .borrow_mut()
            .push((self.username.clone(), context.retain()));
        Outcome::Retained
    }
}

#[derive(Default)]
struct Welcome {
    username: String,
}

impl Poolable for Welcome {
    fn reset(&mut self) {
        self.username.clear();
    }
}

impl Step for Welcome {
    fn execute(&mut self, _context: StepContext) -> Outcome {
        println!("welcome, {}!", self.username);
        Outcome::Done
    }
}

#[derive(Default)]
struct ShowLoginError;

impl Poolable for ShowLoginError {
    fn reset(&mut self) {}
}

impl Step for ShowLoginError {
    fn execute(&mut self, _context: StepContext) -> Outcome {
        println!("login failed, please try again");
        Outcome::Done
    }
}

fn main() {
    let pending: Pending = Rc::default();

    let pool = ObjectPool::new();
    pool.register::<LoginRequested>();
    pool.register::<Welcome>();
    pool.register::<ShowLoginError>();
    pool.register_with({
        let pending = Rc::clone(&pending);
        move || Authenticate {
            username: String::new(),
            pending: Rc::clone(&pending),
        }
    });

    let relay = Relay::new(EventBus::new(pool));

    relay
        .on::<LoginRequested>()
        .add_step_with::<Authenticate, _>(|step, event| {
            step.username.clone_from(&event.borrow().username);
        })
        .add_step_with::<Welcome, _>(|step, event| {
            step.username.clone_from(&event.borrow().username);
        })
        .on_failure::<ShowLoginError>()
        .on_finish(|event, outcome| {
            let verdict = match outcome {
                ChainOutcome::Completed => "completed",
                ChainOutcome::Failed => "failed",
            };
            println!("login chain for {} {verdict}", event.borrow().username);
        })
        .install()
        .expect("all chain types are registered");

    for username in ["ferris", "mallory"] {
        relay
            .bus()
            .publish_with::<LoginRequested>(|event| event.username.push_str(username))
            .expect("event type is registered");
    }

    println!("{} login attempts in flight", relay.active_count());

    // The server answers later, from outside of any chain.
    let replies = pending.borrow_mut().drain(..).collect::<Vec<_>>();
    for (username, completion) in replies {
        if username == "mallory" {
            completion.fail();
        } else {
            completion.done();
        }
    }

    println!("{} login attempts in flight", relay.active_count());
}
